//! HTTP request tracking.
//!
//! [`track_request`] gives every request a container-call context inside
//! the session named by its cookie and runs the rest of the stack with both
//! installed. Handlers read the call context from the request extensions
//! or resolve scoped providers directly.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, header};
use axum::middleware::Next;
use axum::response::Response;
use scope_core::{ContainerCallContext, Context};
use tracing::{debug, warn};

use crate::context::ServerContext;

/// Default name of the session cookie.
pub const SESSION_COOKIE: &str = "SWSESSIONID";

/// Middleware: resolve the session, create the call context, run the
/// request with both installed and close the call afterwards. New sessions
/// are announced with a `Set-Cookie` header.
pub async fn track_request(State(server): State<Arc<ServerContext>>, mut request: Request, next: Next) -> Response {
    let cookie_name = server.config().session.cookie_name.as_str();
    let requested = session_cookie(request.headers(), cookie_name);
    let (session, created) = server.sessions().resolve(requested.as_deref());

    let call = Arc::new(ContainerCallContext::http_request(
        request.method().as_str(),
        request.uri().path(),
        Some(session.clone()),
    ));
    request.extensions_mut().insert(call.clone());
    debug!(call = %call.id(), session = session.session_id(), "request tracked");

    let contexts = server.scopes().contexts_for(&call);
    let mut response = contexts.bind(next.run(request)).await;
    call.close();

    if created {
        let cookie = format!("{cookie_name}={}; Path=/; HttpOnly", session.session_id());
        match HeaderValue::from_str(&cookie) {
            Ok(value) => {
                response.headers_mut().append(header::SET_COOKIE, value);
            }
            Err(e) => warn!(session = session.session_id(), "session cookie not set: {e}"),
        }
    }
    response
}

/// Value of cookie `name` in the request headers.
pub fn session_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim_matches('"').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_cookie_is_found_among_others() {
        let mut headers = HeaderMap::new();
        headers.append(header::COOKIE, HeaderValue::from_static("theme=dark; SWSESSIONID=abc123"));
        headers.append(header::COOKIE, HeaderValue::from_static("other=1"));
        assert_eq!(session_cookie(&headers, SESSION_COOKIE).as_deref(), Some("abc123"));
    }

    #[test]
    fn missing_session_cookie() {
        let mut headers = HeaderMap::new();
        headers.append(header::COOKIE, HeaderValue::from_static("SWSESSIONIDX=nope"));
        assert_eq!(session_cookie(&headers, SESSION_COOKIE), None);
    }
}
