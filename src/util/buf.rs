use anyhow::anyhow;
use bytes::{Buf, BufMut, Bytes};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

pub fn put_usize_varint(buf: &mut impl BufMut, value: usize) {
    buf.put_u64_varint(value as u64);
}

pub fn try_get_usize_varint(buf: &mut impl Buf) -> anyhow::Result<usize> {
    let raw = buf.try_get_u64_varint()
        .map_err(|e| anyhow!("varint error: {:?}", e))?;
    Ok(usize::try_from(raw)?)
}

pub fn put_string(buf: &mut impl BufMut, s: &str) {
    put_usize_varint(buf, s.len());
    buf.put_slice(s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let raw = try_get_bytes(buf)?;
    Ok(String::from_utf8(raw.to_vec())?)
}

pub fn put_bytes(buf: &mut impl BufMut, data: &[u8]) {
    put_usize_varint(buf, data.len());
    buf.put_slice(data);
}

/// Reads length-prefixed bytes, checking the length against the remaining buffer *before*
///  allocating anything
pub fn try_get_bytes(buf: &mut impl Buf) -> anyhow::Result<Bytes> {
    let len = try_get_usize_varint(buf)?;
    if buf.remaining() < len {
        return Err(anyhow!("buffer underflow: expected {} bytes, {} remaining", len, buf.remaining()));
    }
    Ok(buf.copy_to_bytes(len))
}

pub fn try_get_array<const N: usize>(buf: &mut impl Buf) -> anyhow::Result<[u8; N]> {
    if buf.remaining() < N {
        return Err(anyhow!("buffer underflow: expected {} bytes, {} remaining", N, buf.remaining()));
    }
    let mut result = [0u8; N];
    buf.copy_to_slice(&mut result);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::empty("")]
    #[case::ascii("tribes")]
    #[case::non_ascii("Grüße")]
    fn test_string(#[case] s: &str) {
        let mut buf = BytesMut::new();
        put_string(&mut buf, s);
        buf.put_u8(99);

        let mut b: &[u8] = &buf;
        assert_eq!(try_get_string(&mut b).unwrap(), s);
        assert_eq!(b, &[99]);
    }

    #[rstest]
    #[case::empty(b"")]
    #[case::truncated_len(b"\x05abc")]
    fn test_bytes_underflow(#[case] mut buf: &[u8]) {
        assert!(try_get_bytes(&mut buf).is_err());
    }

    #[test]
    fn test_array() {
        let mut buf: &[u8] = b"abcdefg";
        let arr: [u8; 4] = try_get_array(&mut buf).unwrap();
        assert_eq!(&arr, b"abcd");
        assert!(try_get_array::<4>(&mut buf).is_err());
    }
}
