use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

/// A boxed byte stream payload.
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// The payload moved between pipeline stages.
///
/// Adjacent stages must agree on the variants they exchange: the bundled
/// decoders consume any byte-bearing variant (`Bytes`, `Text`, `Stream`,
/// `File`) and emit `Decoded` values, which only downstream consumers that
/// know the concrete type can unpack again.
pub enum Record {
    /// An in-memory byte buffer.
    Bytes(Bytes),
    /// A text payload.
    Text(String),
    /// An open file handle.
    File(File),
    /// A readable byte stream.
    Stream(ByteStream),
    /// A decoded value, type-erased. Shared so a tee can duplicate it.
    Decoded(Arc<dyn Any + Send + Sync>),
}

impl Record {
    /// Wrap a decoded value.
    pub fn decoded<T: Any + Send + Sync>(value: T) -> Self {
        Self::Decoded(Arc::new(value))
    }

    /// Borrow the decoded payload as `T`, if this is a `Decoded` record of
    /// that type.
    pub fn downcast_ref<T: Any + Send + Sync>(&self) -> Option<&T> {
        match self {
            Self::Decoded(value) => value.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Take the decoded payload as `Arc<T>`. Returns the record unchanged
    /// when it is not a `Decoded` value of type `T`.
    pub fn into_decoded<T: Any + Send + Sync>(self) -> std::result::Result<Arc<T>, Record> {
        match self {
            Self::Decoded(value) => value.downcast::<T>().map_err(Self::Decoded),
            other => Err(other),
        }
    }

    /// Cheap duplication for shareable variants.
    ///
    /// `File` and `Stream` carry unique ownership of an external resource
    /// and cannot be duplicated.
    pub fn try_clone(&self) -> Option<Record> {
        match self {
            Self::Bytes(b) => Some(Self::Bytes(b.clone())),
            Self::Text(s) => Some(Self::Text(s.clone())),
            Self::Decoded(v) => Some(Self::Decoded(Arc::clone(v))),
            Self::File(_) | Self::Stream(_) => None,
        }
    }

    /// Materialize any byte-bearing variant into a single buffer.
    ///
    /// `Decoded` records have no byte representation and yield an error
    /// naming the offending stage input.
    pub async fn into_bytes(self) -> Result<Bytes> {
        match self {
            Self::Bytes(b) => Ok(b),
            Self::Text(s) => Ok(Bytes::from(s)),
            Self::File(mut file) => {
                let mut buf = Vec::new();
                file.read_to_end(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
            Self::Stream(mut stream) => {
                let mut buf = Vec::new();
                stream.read_to_end(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
            Self::Decoded(_) => Err(Error::decode(
                "decoded record has no byte representation".to_string(),
            )),
        }
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Self::Text(s) => f.debug_tuple("Text").field(&s.len()).finish(),
            Self::File(_) => f.write_str("File(..)"),
            Self::Stream(_) => f.write_str("Stream(..)"),
            Self::Decoded(_) => f.write_str("Decoded(..)"),
        }
    }
}

impl From<Bytes> for Record {
    fn from(b: Bytes) -> Self {
        Self::Bytes(b)
    }
}

impl From<String> for Record {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for Record {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<File> for Record {
    fn from(f: File) -> Self {
        Self::File(f)
    }
}
