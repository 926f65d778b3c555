//! Canonical origin marker.
//!
//! A rewritten page can drop the embedded origin from its visible path as long
//! as the `_portal5origin` query parameter pins the real origin. These helpers
//! add, read and remove that marker.

use url::form_urlencoded;
use url::Url;

use crate::synthesis::is_web_scheme;

/// Query parameter carrying the real origin of a pinned location.
pub const ORIGIN_MARKER: &str = "_portal5origin";

/// Returns true if `url` carries the origin marker.
pub fn has_origin_marker(url: &Url) -> bool {
    url.query_pairs().any(|(key, _)| key == ORIGIN_MARKER)
}

/// Returns the origin pinned by the marker as a root URL.
pub fn pinned_origin(url: &Url) -> Option<Url> {
    let (_, value) = url.query_pairs().find(|(key, _)| key == ORIGIN_MARKER)?;
    let pinned = Url::parse(&value).ok()?;
    if !is_web_scheme(pinned.scheme()) || !pinned.has_host() {
        return None;
    }
    Url::parse(&pinned.origin().ascii_serialization()).ok()
}

/// Removes the marker from `url`, leaving every other parameter in order.
pub fn strip_origin_marker(url: &mut Url) {
    if !has_origin_marker(url) {
        return;
    }

    let remaining: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != ORIGIN_MARKER)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if remaining.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(remaining);
    }
}

/// Builds the pinned path-and-query for a proxied location.
///
/// The embedded `base` origin is removed from the path, leading slashes are
/// collapsed to one and the marker is set to the base origin.
pub fn pin_origin_marker(location: &Url, base: &Url) -> String {
    let origin = base.origin().ascii_serialization();
    let path = location.path().replacen(&origin, "", 1);
    let path = format!("/{}", path.trim_start_matches('/'));

    let mut query = form_urlencoded::Serializer::new(String::new());
    for (key, value) in location.query_pairs().filter(|(key, _)| key != ORIGIN_MARKER) {
        query.append_pair(&key, &value);
    }
    query.append_pair(ORIGIN_MARKER, &origin);

    match location.fragment() {
        Some(fragment) => format!("{path}?{}#{fragment}", query.finish()),
        None => format!("{path}?{}", query.finish()),
    }
}
