use std::fmt::{Display, Formatter};

use http_body_util::BodyExt;
use tracing::debug;

use crate::cache_key::CacheKey;
use crate::error::{ProxyError, error_chain};
use crate::origin::CacheableResponse;
use crate::store::{ObjectStore, PutObject, StoreBody};

/// How an origin body reached the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WritePath {
    /// Length known up front; the body was piped into the upload.
    Streaming,
    /// Length unknown; the body was read into memory first.
    Buffered,
}

impl WritePath {
    pub fn as_str(&self) -> &'static str {
        match self {
            WritePath::Streaming => "streaming",
            WritePath::Buffered => "buffered",
        }
    }
}

impl Display for WritePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upload a cacheable origin response under `key`.
///
/// With a declared length the origin body is handed to the store as-is, so
/// memory stays bounded by the transport buffers. Without one the whole body
/// is collected first; memory use is then proportional to the object size.
pub async fn write_to_store<S>(
    store: &S,
    key: &CacheKey,
    response: CacheableResponse,
) -> Result<WritePath, ProxyError>
where
    S: ObjectStore + ?Sized,
{
    let CacheableResponse {
        content_type,
        content_length,
        body,
        permit,
    } = response;

    let (path, body) = match content_length {
        Some(content_length) => (
            WritePath::Streaming,
            StoreBody::Streaming {
                body,
                content_length,
            },
        ),
        None => {
            let bytes = body
                .collect()
                .await
                .map_err(|err| ProxyError::OriginUnavailable(error_chain(&*err)))?
                .to_bytes();
            (WritePath::Buffered, StoreBody::Buffered(bytes))
        }
    };

    debug!(key = %key, path = %path, content_length = body.content_length(), "writing to store");
    store.put(key, PutObject { content_type, body }).await?;
    drop(permit);

    Ok(path)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use bytes::Bytes;
    use futures_util::stream;
    use http_body_util::{Full, StreamBody};
    use hyper::body::Frame;

    use super::*;
    use crate::store::{BoxError, Existence};

    #[derive(Default)]
    struct RecordingStore {
        puts: Mutex<Vec<(String, Option<String>, bool, u64, Bytes)>>,
    }

    #[async_trait]
    impl ObjectStore for RecordingStore {
        async fn head(&self, _key: &CacheKey) -> Result<Existence, ProxyError> {
            Ok(Existence::Absent)
        }

        async fn put(&self, key: &CacheKey, object: PutObject) -> Result<(), ProxyError> {
            let streaming = object.body.is_streaming();
            let declared = object.body.content_length();
            let bytes = object
                .body
                .into_bytes()
                .await
                .map_err(|err| ProxyError::OriginUnavailable(err.to_string()))?;
            self.puts.lock().unwrap().push((
                key.object_key().to_string(),
                object.content_type,
                streaming,
                declared,
                bytes,
            ));
            Ok(())
        }
    }

    fn key() -> CacheKey {
        CacheKey::new("use1", "bucket-use1", "ftp.mozilla.org/abc".to_string())
    }

    fn chunked(parts: &[&'static str]) -> crate::store::StreamingBody {
        let frames = parts
            .iter()
            .map(|part| Ok::<_, BoxError>(Frame::data(Bytes::from_static(part.as_bytes()))))
            .collect::<Vec<_>>();
        BodyExt::boxed(StreamBody::new(stream::iter(frames)))
    }

    #[tokio::test]
    async fn known_length_streams() {
        let store = RecordingStore::default();
        let body = Full::new(Bytes::from_static(b"payload"))
            .map_err(|never| match never {})
            .boxed();
        let response = CacheableResponse::new(Some("application/zip".to_string()), Some(7), body);

        let path = write_to_store(&store, &key(), response).await.unwrap();

        assert_eq!(path, WritePath::Streaming);
        let puts = store.puts.lock().unwrap();
        assert_eq!(puts.len(), 1);
        let (object_key, content_type, streaming, declared, bytes) = &puts[0];
        assert_eq!(object_key, "ftp.mozilla.org/abc");
        assert_eq!(content_type.as_deref(), Some("application/zip"));
        assert!(*streaming);
        assert_eq!(*declared, 7);
        assert_eq!(bytes, &Bytes::from_static(b"payload"));
    }

    #[tokio::test]
    async fn unknown_length_buffers() {
        let store = RecordingStore::default();
        let response = CacheableResponse::new(None, None, chunked(&["pay", "lo", "ad"]));

        let path = write_to_store(&store, &key(), response).await.unwrap();

        assert_eq!(path, WritePath::Buffered);
        let puts = store.puts.lock().unwrap();
        let (_, content_type, streaming, declared, bytes) = &puts[0];
        assert_eq!(content_type, &None);
        assert!(!*streaming);
        assert_eq!(*declared, 7);
        assert_eq!(bytes, &Bytes::from_static(b"payload"));
    }

    #[tokio::test]
    async fn both_paths_store_identical_bytes() {
        let streamed = RecordingStore::default();
        let buffered = RecordingStore::default();

        write_to_store(
            &streamed,
            &key(),
            CacheableResponse::new(None, Some(11), chunked(&["hello", " ", "world"])),
        )
        .await
        .unwrap();
        write_to_store(
            &buffered,
            &key(),
            CacheableResponse::new(None, None, chunked(&["hello", " ", "world"])),
        )
        .await
        .unwrap();

        assert_eq!(
            streamed.puts.lock().unwrap()[0].4,
            buffered.puts.lock().unwrap()[0].4
        );
    }

    #[tokio::test]
    async fn body_error_while_buffering_is_an_origin_failure() {
        let store = RecordingStore::default();
        let frames: Vec<Result<Frame<Bytes>, BoxError>> = vec![
            Ok(Frame::data(Bytes::from_static(b"partial"))),
            Err("connection reset".into()),
        ];
        let body = BodyExt::boxed(StreamBody::new(stream::iter(frames)));

        let result = write_to_store(&store, &key(), CacheableResponse::new(None, None, body)).await;

        assert!(matches!(result, Err(ProxyError::OriginUnavailable(_))));
        assert!(store.puts.lock().unwrap().is_empty());
    }

    #[test]
    fn path_labels() {
        assert_eq!(WritePath::Streaming.to_string(), "streaming");
        assert_eq!(WritePath::Buffered.as_str(), "buffered");
    }
}
