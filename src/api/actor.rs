/// Actor extraction from forwarded session headers
///
/// Authentication happens upstream. The gateway forwards who the user is and
/// what they may do; this module turns those headers into an [`Actor`].

use crate::{
    error::ApprovalError,
    workflow::types::{Actor, Team},
};
use axum::{extract::FromRequestParts, http::request::Parts, http::HeaderMap};

pub const EMAIL_HEADER: &str = "x-user-email";
pub const TEAM_HEADER: &str = "x-user-team";
pub const APPROVER_HEADER: &str = "x-user-approver";
pub const PANEL_APPROVER_HEADER: &str = "x-user-panel-approver";

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn flag(headers: &HeaderMap, name: &str) -> bool {
    matches!(header(headers, name), Some(value) if value.eq_ignore_ascii_case("true") || value == "1")
}

impl Actor {
    /// Build the actor from session headers. Fails without an email.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, ApprovalError> {
        let email = header(headers, EMAIL_HEADER).ok_or(ApprovalError::Unauthenticated)?;

        let team = match header(headers, TEAM_HEADER) {
            Some(raw) => match raw.parse::<Team>() {
                Ok(team) => Some(team),
                Err(e) => {
                    tracing::warn!("⚠️ Ignoring team header for {}: {}", email, e);
                    None
                }
            },
            None => None,
        };

        Ok(Actor {
            email: email.to_string(),
            team,
            approver: flag(headers, APPROVER_HEADER),
            panel_approver: flag(headers, PANEL_APPROVER_HEADER),
        })
    }
}

impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = ApprovalError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Actor::from_headers(&parts.headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(*value));
        }
        map
    }

    #[test]
    fn reads_capabilities_from_headers() {
        let actor = Actor::from_headers(&headers(&[
            (EMAIL_HEADER, "manager@hackney.gov.uk"),
            (TEAM_HEADER, "Access"),
            (APPROVER_HEADER, "true"),
        ]))
        .unwrap();

        assert_eq!(actor.email, "manager@hackney.gov.uk");
        assert_eq!(actor.team, Some(Team::Access));
        assert!(actor.approver);
        assert!(!actor.panel_approver);
    }

    #[test]
    fn missing_email_is_unauthenticated() {
        let err = Actor::from_headers(&headers(&[(APPROVER_HEADER, "true")])).unwrap_err();
        assert!(matches!(err, ApprovalError::Unauthenticated));
    }

    #[test]
    fn unknown_team_and_odd_flags_are_ignored() {
        let actor = Actor::from_headers(&headers(&[
            (EMAIL_HEADER, "reviewer@x.org"),
            (TEAM_HEADER, "Finance"),
            (PANEL_APPROVER_HEADER, "yes"),
        ]))
        .unwrap();

        assert_eq!(actor.team, None);
        assert!(!actor.panel_approver);
    }
}
