use std::fmt::{Display, Formatter};

use crate::route::RequestContext;

/// Object name used when the request path has no trailing segment.
pub const DEFAULT_FILENAME: &str = "index.html";

/// Shape of the object key below the backend prefix.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum KeyStyle {
    /// `<backend>/<md5(path)>`
    #[default]
    Hash,
    /// `<backend>/<md5(path)>/<basename(path)>`, readable in bucket listings
    /// and giving downloads a sensible file name.
    HashWithFilename,
}

/// Address of one cached object: the region's bucket plus the object key.
///
/// Derived from (region, backend, path) only, so the existence check, the upload,
/// the signed URL and the single-flight map all agree on it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    region: String,
    bucket: String,
    object_key: String,
}

impl CacheKey {
    pub fn new(region: impl Into<String>, bucket: impl Into<String>, object_key: String) -> Self {
        Self {
            region: region.into(),
            bucket: bucket.into(),
            object_key,
        }
    }

    pub fn derive(ctx: &RequestContext, style: KeyStyle) -> Self {
        let region = ctx.region();
        Self::new(
            region.id.as_str(),
            region.bucket.as_str(),
            object_key(&ctx.backend().id, ctx.path(), style),
        )
    }

    /// Region id, which selects the store client.
    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Key without a leading slash, as written, checked and signed.
    pub fn object_key(&self) -> &str {
        &self.object_key
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.bucket, self.object_key)
    }
}

pub fn object_key(backend: &str, path: &str, style: KeyStyle) -> String {
    match style {
        KeyStyle::Hash => format!("{backend}/{}", path_hash(path)),
        KeyStyle::HashWithFilename => {
            format!("{backend}/{}/{}", path_hash(path), filename(path))
        }
    }
}

/// Hex md5 of the full request path including the query string.
pub fn path_hash(path: &str) -> String {
    format!("{:x}", md5::compute(path.as_bytes()))
}

/// Last segment of the path (query stripped), or [`DEFAULT_FILENAME`].
pub fn filename(path: &str) -> &str {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    match path.rsplit('/').next() {
        Some(name) if !name.is_empty() => name,
        _ => DEFAULT_FILENAME,
    }
}
