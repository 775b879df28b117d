//! Ownership tags the bridge writes into Consul service registrations.
//!
//! Tag format is `consular-<name>=<value>`. The first `=` is the separator;
//! values may themselves contain `=`, so parsers strip the exact prefix and
//! keep the remainder verbatim.

use crate::errors::BridgeError;

/// Prefix of the tag carrying this bridge instance's identity.
pub const REG_ID_PREFIX: &str = "consular-reg-id=";

/// Prefix of the tag carrying the Marathon app id a service belongs to.
pub const APP_ID_PREFIX: &str = "consular-app-id=";

/// Tag marking a service as owned by the bridge instance `registration_id`.
pub fn reg_id_tag(registration_id: &str) -> String {
    format!("{}{}", REG_ID_PREFIX, registration_id)
}

/// Tag recording the Marathon app id a registration was derived from.
pub fn app_id_tag(app_id: &str) -> String {
    format!("{}{}", APP_ID_PREFIX, app_id)
}

/// Whether `tags` contains this instance's reg-id tag. The comparison is an
/// exact string match against the full `consular-reg-id=<id>` tag, so other
/// bridge instances' services never match.
pub fn matches_reg_id(tags: &[String], registration_id: &str) -> bool {
    let expected = reg_id_tag(registration_id);
    tags.iter().any(|tag| *tag == expected)
}

/// Extracts the app id from a service's tag list.
///
/// Returns `Ok(None)` when no app-id tag is present and
/// [`BridgeError::AmbiguousOwnership`] when there is more than one: such a
/// service cannot be correlated back to a single app.
pub fn app_id_from_tags(
    service_id: &str,
    tags: &[String],
) -> Result<Option<String>, BridgeError> {
    let mut found = None;
    for tag in tags {
        if let Some(app_id) = tag.strip_prefix(APP_ID_PREFIX) {
            if found.is_some() {
                return Err(BridgeError::AmbiguousOwnership {
                    service_id: service_id.to_string(),
                });
            }
            found = Some(app_id.to_string());
        }
    }
    Ok(found)
}
