//! Utilities for generating HTTP responses on authorization failures

use dlqt_oauth2::GrantRef;
use http::{header, HeaderValue, Response, StatusCode};

const UNAUTHORIZED_BODY: &str = "unauthorized";
const FORBIDDEN_BODY: &str = "forbidden";
const UNAVAILABLE_BODY: &str = "service unavailable";

/// Build a `401 Unauthorized` response with the appropriate `www-authenticate`
/// header
///
/// The description provided will be automatically escaped to make sure it
/// is header-friendly.
///
/// The prepared response will have the form:
///
/// ```http
/// HTTP/1.1 401 Unauthorized
/// www-authenticate: Bearer error="invalid_token" error_description="{description}"
/// content-type: text/plain; charset=utf-8
///
/// unauthorized
/// ```
///
/// `error_description` is omitted if `description` is empty.
pub fn unauthorized<Body: From<&'static str>>(description: &str) -> Response<Body> {
    let mut resp = plain_text(StatusCode::UNAUTHORIZED, UNAUTHORIZED_BODY);
    resp.headers_mut()
        .insert(header::WWW_AUTHENTICATE, invalid_token(description));
    resp
}

/// Build a `403 Forbidden` response with the appropriate `www-authenticate` header
///
/// The description provided will be automatically escaped to make sure it
/// is header-friendly.
///
/// When a missing `grant` is given, the prepared response will have the form:
///
/// ```http
/// HTTP/1.1 403 Forbidden
/// www-authenticate: Bearer error="insufficient_scope" error_description="{description}" scope="dlq.purge"
/// content-type: text/plain; charset=utf-8
///
/// forbidden
/// ```
///
/// `error_description` is omitted if `description` is empty, and `scope` is
/// omitted if no grant is given.
pub fn forbidden<Body: From<&'static str>>(
    description: &str,
    grant: Option<&GrantRef>,
) -> Response<Body> {
    let mut resp = plain_text(StatusCode::FORBIDDEN, FORBIDDEN_BODY);
    resp.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        insufficient_scope(description, grant),
    );
    resp
}

/// Build a `503 Service Unavailable` response
///
/// Used when the identity provider's keys cannot be obtained; the caller is
/// not at fault and may retry.
pub fn unavailable<Body: From<&'static str>>() -> Response<Body> {
    plain_text(StatusCode::SERVICE_UNAVAILABLE, UNAVAILABLE_BODY)
}

fn plain_text<Body: From<&'static str>>(status: StatusCode, text: &'static str) -> Response<Body> {
    let mut resp = Response::new(Body::from(text));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

fn invalid_token(description: &str) -> HeaderValue {
    const BARE: &str = r#"Bearer error="invalid_token""#;

    if description.is_empty() {
        HeaderValue::from_static(BARE)
    } else {
        HeaderValue::try_from(format!(
            r#"{BARE} error_description="{}""#,
            description.escape_default()
        ))
        .unwrap_or_else(|_| HeaderValue::from_static(BARE))
    }
}

// A `Grant` only holds printable ASCII without `\` or `"`, so it never needs
// escaping inside the quoted `scope` parameter.
fn insufficient_scope(description: &str, grant: Option<&GrantRef>) -> HeaderValue {
    const BARE: &str = r#"Bearer error="insufficient_scope""#;

    let mut value = String::from(BARE);
    if !description.is_empty() {
        value.push_str(&format!(
            r#" error_description="{}""#,
            description.escape_default()
        ));
    }
    if let Some(grant) = grant {
        value.push_str(&format!(r#" scope="{grant}""#));
    }

    HeaderValue::try_from(value).unwrap_or_else(|_| HeaderValue::from_static(BARE))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    #[test]
    fn in_unauthorized_description_unicode_and_non_printing_description_does_not_panic() {
        let resp = unauthorized::<String>(
            "\0\n\ttest™: \"Ĉu oni povas bone ŝanĝi ĉi tiu mesaĝon en respondon?\"",
        );

        let headers = extract_www_authenticate_headers(&resp);

        let expected = BTreeSet::from([
            r#"Bearer error="invalid_token" error_description="\u{0}\n\ttest\u{2122}: \"\u{108}u oni povas bone \u{15d}an\u{11d}i \u{109}i tiu mesa\u{11d}on en respondon?\"""#,
        ]);

        assert_eq!(headers, expected);
    }

    #[test]
    fn in_unauthorized_with_empty_description_doesnt_include_description() {
        let resp = unauthorized::<String>("");

        let headers = extract_www_authenticate_headers(&resp);

        let expected = BTreeSet::from([r#"Bearer error="invalid_token""#]);

        assert_eq!(headers, expected);
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(resp.body(), "unauthorized");
    }

    #[test]
    fn in_forbidden_with_grant_names_the_scope() {
        let resp = forbidden::<String>("", Some(GrantRef::from_static("dlq.purge")));

        let headers = extract_www_authenticate_headers(&resp);

        let expected = BTreeSet::from([r#"Bearer error="insufficient_scope" scope="dlq.purge""#]);

        assert_eq!(headers, expected);
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn in_forbidden_with_description_and_grant_includes_both() {
        let resp = forbidden::<String>(
            "descriptive error",
            Some(GrantRef::from_static("dlq.purge")),
        );

        let headers = extract_www_authenticate_headers(&resp);

        let expected = BTreeSet::from([
            r#"Bearer error="insufficient_scope" error_description="descriptive error" scope="dlq.purge""#,
        ]);

        assert_eq!(headers, expected);
    }

    #[test]
    fn in_forbidden_with_no_grant_and_empty_description_is_bare() {
        let resp = forbidden::<String>("", None);

        let headers = extract_www_authenticate_headers(&resp);

        let expected = BTreeSet::from([r#"Bearer error="insufficient_scope""#]);

        assert_eq!(headers, expected);
        assert_eq!(resp.body(), "forbidden");
    }

    #[test]
    fn unavailable_has_no_challenge() {
        let resp = unavailable::<String>();

        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(resp.headers().get(header::WWW_AUTHENTICATE).is_none());
    }

    fn extract_www_authenticate_headers<B>(resp: &Response<B>) -> BTreeSet<&str> {
        resp.headers()
            .get_all(header::WWW_AUTHENTICATE)
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect::<BTreeSet<_>>()
    }
}
