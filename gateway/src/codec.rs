// Copyright 2024 Cobalt Network Foundation
// This file is part of the cobalt library.

// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:

// http://www.apache.org/licenses/LICENSE-2.0

// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Length-prefixed object encoding over a byte stream.
//!
//! Each object is written as a little-endian `u64` payload length followed by
//! the bincode-encoded payload. Reads enforce a caller-supplied bound on the
//! payload length and fail with [`Error::ObjectTooLarge`] beyond it. The
//! handshake runs entirely on this codec; substreams only use it for the RPC
//! name that opens them.

use std::io;

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Error, Result};

/// Writes a single length-prefixed object to the stream.
pub async fn write_object<S, T>(stream: &mut S, object: &T) -> Result<()>
where
    S: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let payload = bincode::serialize(object)
        .map_err(|_| Error::Io("failed to encode object", io::ErrorKind::InvalidData.into()))?;

    stream
        .write_all(&(payload.len() as u64).to_le_bytes())
        .await
        .map_err(Error::io("failed to write object length"))?;
    stream.write_all(&payload).await.map_err(Error::io("failed to write object"))?;
    stream.flush().await.map_err(Error::io("failed to flush object"))?;

    Ok(())
}

/// Reads a single length-prefixed object from the stream, enforcing the
/// given bound on the encoded payload length.
pub async fn read_object<S, T>(stream: &mut S, max_len: u64) -> Result<T>
where
    S: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut length = [0u8; 8];
    stream.read_exact(&mut length).await.map_err(Error::io("failed to read object length"))?;
    let length = u64::from_le_bytes(length);

    if length > max_len {
        return Err(Error::ObjectTooLarge);
    }

    let mut payload = vec![0u8; length as usize];
    stream.read_exact(&mut payload).await.map_err(Error::io("failed to read object"))?;

    bincode::deserialize(&payload)
        .map_err(|_| Error::Io("failed to decode object", io::ErrorKind::InvalidData.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        id: [u8; 8],
        label: String,
    }

    #[tokio::test]
    async fn object_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        let sample = Sample { id: [7; 8], label: "hello".into() };
        write_object(&mut a, &sample).await.unwrap();

        let decoded: Sample = read_object(&mut b, 1024).await.unwrap();
        assert_eq!(decoded, sample);
    }

    #[tokio::test]
    async fn oversized_object_is_distinct() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        write_object(&mut a, "a string that encodes to more than a few bytes").await.unwrap();

        let result: Result<String> = read_object(&mut b, 10).await;
        assert!(matches!(result, Err(Error::ObjectTooLarge)));
    }

    #[tokio::test]
    async fn truncated_stream_is_io() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        a.write_all(&100u64.to_le_bytes()).await.unwrap();
        a.write_all(b"short").await.unwrap();
        drop(a);

        let result: Result<String> = read_object(&mut b, 1024).await;
        assert!(matches!(result, Err(Error::Io(..))));
    }
}
