//! In-memory gzip/deflate coding for buffered payloads.

use async_compression::tokio::bufread::{GzipDecoder, GzipEncoder, ZlibDecoder, ZlibEncoder};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

use super::{Error, MAX_BUFFERED_PAYLOAD};

pub const GZIP: &str = "gzip";
/// RFC 9110 `deflate` means a zlib wrapper with default window bits.
pub const DEFLATE: &str = "deflate";

pub async fn encode(body: &[u8], encoding: &str) -> Result<Bytes, Error> {
	let reader = BufReader::new(body);
	let encoder: Box<dyn AsyncRead + Unpin + Send> = match encoding {
		GZIP => Box::new(GzipEncoder::new(reader)),
		DEFLATE => Box::new(ZlibEncoder::new(reader)),
		other => return Err(Error::UnsupportedEncoding(other.to_string())),
	};
	read_to_bytes(encoder, usize::MAX).await
}

pub async fn decode(body: &[u8], encoding: &str) -> Result<Bytes, Error> {
	let reader = BufReader::new(body);
	let decoder: Box<dyn AsyncRead + Unpin + Send> = match encoding {
		GZIP => Box::new(GzipDecoder::new(reader)),
		DEFLATE => Box::new(ZlibDecoder::new(reader)),
		other => return Err(Error::UnsupportedEncoding(other.to_string())),
	};
	// The decoded size is bounded so a hostile payload cannot balloon past
	// what the buffering ceiling permits.
	read_to_bytes(decoder, MAX_BUFFERED_PAYLOAD).await
}

async fn read_to_bytes<R>(mut reader: R, limit: usize) -> Result<Bytes, Error>
where
	R: AsyncRead + Unpin,
{
	let initial = if limit == usize::MAX {
		8192
	} else {
		limit.min(65536)
	};
	let mut buffer = BytesMut::with_capacity(initial);
	loop {
		let n = reader.read_buf(&mut buffer).await?;
		if buffer.len() > limit {
			return Err(Error::PayloadTooLarge);
		}
		if n == 0 {
			break;
		}
	}
	Ok(buffer.freeze())
}
