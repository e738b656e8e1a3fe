use std::io::{self, Cursor};
use tokio::io::{AsyncRead, AsyncReadExt, Chain};

/// Number of leading bytes inspected to classify a tunnel
pub const SNIFF_LEN: usize = 16;

/// Request-line prefixes that identify plain HTTP
pub const HTTP_METHOD_PREFIXES: [&[u8]; 9] = [
    b"GET ",
    b"POST ",
    b"PUT ",
    b"DELETE ",
    b"HEAD ",
    b"OPTIONS ",
    b"PATCH ",
    b"CONNECT ",
    b"TRACE ",
];

pub fn looks_like_http(prefix: &[u8]) -> bool {
    HTTP_METHOD_PREFIXES
        .iter()
        .any(|method| prefix.starts_with(method))
}

/// A client stream whose first bytes have been inspected. Reading from
/// `reader` yields the inspected bytes again before the rest of the stream.
pub struct Sniffed<R> {
    pub is_http: bool,
    pub reader: Chain<Cursor<Vec<u8>>, R>,
}

/// Inspect the first [`SNIFF_LEN`] bytes of `reader` without losing them.
///
/// A stream that ends before enough bytes arrive is an error, not a negative.
pub async fn sniff<R>(mut reader: R) -> io::Result<Sniffed<R>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = vec![0u8; SNIFF_LEN];
    reader.read_exact(&mut prefix).await?;

    Ok(Sniffed {
        is_http: looks_like_http(&prefix),
        reader: Cursor::new(prefix).chain(reader),
    })
}
