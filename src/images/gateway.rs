//! Content-addressed gateway URLs.

/// Requested render size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dimensions {
  pub width: u32,
  pub height: u32,
}

impl Dimensions {
  pub fn new(width: u32, height: u32) -> Self {
    Self { width, height }
  }

  /// Whether an image this size is large enough to need a signed URL.
  pub fn needs_signing(&self, min_dimension: u32) -> bool {
    self.width.max(self.height) >= min_dimension
  }
}

/// The content id in a gateway URL: the path segment after `/files/`.
pub fn content_id(source: &str) -> Option<&str> {
  let (_, rest) = source.split_once("/files/")?;
  let end = rest
    .find(|c: char| matches!(c, '?' | '#' | '/'))
    .unwrap_or(rest.len());
  let cid = &rest[..end];
  (!cid.is_empty()).then_some(cid)
}

/// The unsigned URL for `cid` at `dims`. Doubles as the cache key.
pub fn sized_url(host: &str, cid: &str, dims: Dimensions) -> String {
  format!(
    "https://{}/files/{}?img-width={}&img-height={}",
    host, cid, dims.width, dims.height
  )
}
