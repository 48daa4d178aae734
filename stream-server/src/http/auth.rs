use super::AppState;
use crate::error::StreamError;
use axum::{
    extract::{Query, Request, State},
    http::{header, HeaderMap, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use subtle::ConstantTimeEq;

/// 访问令牌校验：未配置令牌时放行；否则要求 `Authorization: Bearer <token>` 或 `?token=`
pub async fn require_token(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(expected) = state.access_token.as_deref() else {
        return next.run(request).await;
    };

    let provided = bearer_token(request.headers()).or_else(|| query_token(request.uri()));

    match provided {
        Some(token) if token_matches(&token, expected) => next.run(request).await,
        _ => StreamError::Unauthorized.into_response(),
    }
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// 查询参数中的令牌，已做百分号解码
fn query_token(uri: &Uri) -> Option<String> {
    let Query(query) = Query::<TokenQuery>::try_from_uri(uri).ok()?;
    query.token.filter(|token| !token.is_empty())
}

/// 常数时间比较
fn token_matches(provided: &str, expected: &str) -> bool {
    provided.len() == expected.len() && bool::from(provided.as_bytes().ct_eq(expected.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        assert_eq!(bearer_token(&headers).as_deref(), Some("secret"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn test_query_token() {
        let uri = |s: &str| s.parse::<Uri>().unwrap();
        assert_eq!(query_token(&uri("/ws?fps=10&token=abc")).as_deref(), Some("abc"));
        assert_eq!(query_token(&uri("/ws?fps=10")), None);
        assert_eq!(query_token(&uri("/ws?token=")), None);
        assert_eq!(query_token(&uri("/ws")), None);
    }

    #[test]
    fn test_query_token_is_percent_decoded() {
        let uri: Uri = "/ws?token=a%2Bb%3Dc%26d&fps=10".parse().unwrap();
        assert_eq!(query_token(&uri).as_deref(), Some("a+b=c&d"));

        let uri: Uri = "/ws?token=two+words".parse().unwrap();
        assert_eq!(query_token(&uri).as_deref(), Some("two words"));
    }

    #[test]
    fn test_token_matches() {
        assert!(token_matches("secret", "secret"));
        assert!(!token_matches("secreT", "secret"));
        assert!(!token_matches("secret-longer", "secret"));
        assert!(!token_matches("", "secret"));
    }
}
