use url::Url;

use crate::{
    error::{TsumugiError, TsumugiResult},
    util::range::ByteRange,
};

pub(crate) fn is_absolute_url(s: &str) -> bool {
    s.starts_with("http://")
        || s.starts_with("https://")
        || s.starts_with("file://")
        || s.starts_with("ftp://")
}

/// Join `new` onto `current`, carrying over the query of `current` when the
/// joined URL has none.
///
/// ```text
/// https://example.com/manifest.mpd?auth=secret + /video42.mp4
///   => https://example.com/video42.mp4?auth=secret
/// https://example.com/manifest.mpd?auth=old + /video42.mp4?auth=new
///   => https://example.com/video42.mp4?auth=new
/// ```
pub fn merge_baseurls(current: &Url, new: &str) -> TsumugiResult<Url> {
    let new = new.trim();
    if is_absolute_url(new) {
        return Ok(Url::parse(new)?);
    }

    let mut merged = current.join(new)?;
    if merged.query().is_none() {
        merged.set_query(current.query());
    }
    Ok(merged)
}

/// Parse an RFC 7233 `first-last` byte range, as used by `@mediaRange` and
/// `Initialization@range`.
pub(crate) fn parse_media_range(s: &str) -> TsumugiResult<ByteRange> {
    let invalid = || TsumugiError::MpdParsing(format!("Invalid media range: {s}"));

    let (start, end) = s.trim().split_once('-').ok_or_else(invalid)?;
    let first = start.parse::<u64>().map_err(|_| invalid())?;
    let last = match end {
        "" => None,
        end => Some(end.parse::<u64>().map_err(|_| invalid())?),
    };

    match last {
        Some(last) if last < first => Err(invalid()),
        // `0-500` is 501 bytes
        last => Ok(ByteRange::new(first, last.map(|last| last - first + 1))),
    }
}
