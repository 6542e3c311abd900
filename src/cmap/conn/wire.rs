use std::sync::atomic::{AtomicI32, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    bson::Document,
    error::{Error, ErrorKind, Result},
};

/// The wire protocol op code for the OP_MSG message format.
pub(crate) const OP_MSG: i32 = 2013;
/// The wire protocol op code for compressed messages. Wire compression is negotiated by an
/// outer layer; this crate rejects compressed frames.
const OP_COMPRESSED: i32 = 2012;

const HEADER_LENGTH: i32 = 16;
const DEFAULT_MAX_MESSAGE_SIZE_BYTES: i32 = 48 * 1024 * 1024;

pub(crate) const CHECKSUM_PRESENT: u32 = 0b1;
#[allow(dead_code)]
pub(crate) const MORE_TO_COME: u32 = 0b10;

static REQUEST_ID: AtomicI32 = AtomicI32::new(0);

/// Returns a monotonically increasing id for use with wire messages.
pub(crate) fn next_request_id() -> i32 {
    REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

/// The header for any wire protocol message.
#[derive(Debug)]
struct Header {
    length: i32,
    request_id: i32,
    response_to: i32,
    op_code: i32,
}

impl Header {
    async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            length: reader.read_i32_le().await?,
            request_id: reader.read_i32_le().await?,
            response_to: reader.read_i32_le().await?,
            op_code: reader.read_i32_le().await?,
        })
    }
}

/// A wire protocol message in the OP_MSG format, carrying a single body section.
#[derive(Debug)]
pub(crate) struct Message {
    pub(crate) request_id: i32,
    pub(crate) response_to: i32,
    pub(crate) flags: u32,
    pub(crate) document: Document,
}

impl Message {
    /// Creates a `Message` from a BSON command body. The `$db` field must already be present.
    pub(crate) fn new(document: Document, request_id: impl Into<Option<i32>>) -> Self {
        Self {
            request_id: request_id.into().unwrap_or_else(next_request_id),
            response_to: 0,
            flags: 0,
            document,
        }
    }

    /// Reads a message from the provided reader, validating its framing.
    pub(crate) async fn read_from<R: AsyncRead + Unpin>(
        reader: &mut R,
        max_message_size_bytes: Option<i32>,
    ) -> Result<Self> {
        let max_len = max_message_size_bytes.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE_BYTES);

        let header = Header::read_from(reader).await?;

        if header.op_code == OP_COMPRESSED {
            return Err(Error::invalid_response(
                "server sent a compressed message, but compression was not negotiated",
            ));
        }
        if header.op_code != OP_MSG {
            return Err(Error::invalid_response(format!(
                "unexpected op code {} in server reply",
                header.op_code
            )));
        }
        if header.length < HEADER_LENGTH + 5 || header.length > max_len {
            return Err(Error::invalid_response(format!(
                "invalid message length {} in server reply",
                header.length
            )));
        }

        let mut buf = vec![0u8; (header.length - HEADER_LENGTH) as usize];
        reader.read_exact(&mut buf).await?;

        let flags = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let mut payload = &buf[4..];
        if flags & CHECKSUM_PRESENT != 0 {
            let len = payload.len();
            if len < 4 {
                return Err(Error::invalid_response("truncated message checksum"));
            }
            payload = &payload[..len - 4];
        }

        // Server replies consist of a single body section (payload type 0).
        match payload.first() {
            Some(0) => {}
            _ => {
                return Err(Error::invalid_response(
                    "expected a body section in server reply",
                ))
            }
        }

        let document = Document::from_reader(&payload[1..])?;

        Ok(Self {
            request_id: header.request_id,
            response_to: header.response_to,
            flags,
            document,
        })
    }

    /// Serializes this message and writes it to the provided writer.
    pub(crate) async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let mut doc_bytes = Vec::new();
        self.document.to_writer(&mut doc_bytes)?;

        let total_length = HEADER_LENGTH as usize + 4 + 1 + doc_bytes.len();
        let total_length: i32 = total_length.try_into().map_err(|_| {
            ErrorKind::InvalidArgument {
                message: "command exceeds maximum message size".to_string(),
            }
        })?;

        writer.write_i32_le(total_length).await?;
        writer.write_i32_le(self.request_id).await?;
        writer.write_i32_le(self.response_to).await?;
        writer.write_i32_le(OP_MSG).await?;
        writer.write_u32_le(self.flags & !CHECKSUM_PRESENT).await?;
        writer.write_u8(0).await?;
        writer.write_all(&doc_bytes).await?;
        writer.flush().await?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bson::doc;

    #[tokio::test]
    async fn message_round_trip() {
        let body = doc! { "ping": 1, "$db": "admin" };
        let message = Message::new(body.clone(), 42);

        let mut buf = Vec::new();
        message.write_to(&mut buf).await.unwrap();

        let read = Message::read_from(&mut buf.as_slice(), None).await.unwrap();
        assert_eq!(read.request_id, 42);
        assert_eq!(read.document, body);
        assert_eq!(read.flags & MORE_TO_COME, 0);
    }

    #[tokio::test]
    async fn rejects_wrong_op_code() {
        let body = doc! { "ok": 1 };
        let message = Message::new(body, 1);
        let mut buf = Vec::new();
        message.write_to(&mut buf).await.unwrap();
        // Corrupt the op code field.
        buf[12..16].copy_from_slice(&999i32.to_le_bytes());

        assert!(Message::read_from(&mut buf.as_slice(), None).await.is_err());
    }
}
