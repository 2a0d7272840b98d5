pub fn fixed_xor(buf1: &[u8], buf2: &[u8]) -> Vec<u8> {
    assert_eq!(buf1.len(), buf2.len());
    buf1.iter()
        .zip(buf2.iter())
        .map(|(x,y)| x ^ y)
        .collect()
}

#[test]
fn test_fixed_xor() {
    let case_buf1 = hex!("1c0111001f010100061a024b53535009181c");
    let case_buf2 = hex!("686974207468652062756c6c277320657965");
    let expected = hex!("746865206b696420646f6e277420706c6179");
    let result = fixed_xor(&case_buf1, &case_buf2);
    assert_eq!(result, expected);
}

pub fn xor_in_place(dst: &mut [u8], src: &[u8]) {
    assert_eq!(dst.len(), src.len());
    dst.iter_mut()
        .zip(src.iter())
        .for_each(|(x, y)| *x ^= y);
}

#[test]
fn test_xor_in_place() {
    let mut buf = *b"abc";
    xor_in_place(&mut buf, b"abc");
    assert_eq!([0u8; 3], buf);
}
