//! Scope propagation observed the way application code sees it, from
//! nested tracking up to request and session sharing across a worker
//! thread hand-off.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, header};
use axum::routing::get;
use parking_lot::Mutex;
use scope_core::{ContainerCallContext, ContextTracker, HttpSessionContext, Key, ScopeModule, ScopedProvider};
use scope_server::{ScopeRejection, ServerConfig, ServerContext, app};
use tower::ServiceExt;

// ─────────────────────────────────────────────────────────────────────────────
// Nesting
// ─────────────────────────────────────────────────────────────────────────────

mod nesting {
    use super::*;

    /// Install `chain[level]`, check it, recurse, check the restore. Panics
    /// at `fail_at`.
    fn descend(tracker: &ContextTracker<HttpSessionContext>, chain: &[Arc<HttpSessionContext>], level: usize, fail_at: Option<usize>) {
        if level == chain.len() {
            return;
        }
        tracker.track_while_executing(chain[level].clone(), || {
            let current = tracker.current().unwrap();
            assert!(Arc::ptr_eq(&current, &chain[level]));
            if fail_at == Some(level) {
                panic!("failure at level {level}");
            }
            descend(tracker, chain, level + 1, fail_at);
            let restored = tracker.current().unwrap();
            assert!(Arc::ptr_eq(&restored, &chain[level]));
        });
    }

    #[test]
    fn every_depth_restores_the_previous_context() {
        let tracker = ContextTracker::<HttpSessionContext>::new();
        let outer = Arc::new(HttpSessionContext::new("outer"));

        for depth in 1..=6 {
            let chain: Vec<_> = (0..depth)
                .map(|level| Arc::new(HttpSessionContext::new(format!("level-{level}"))))
                .collect();
            let failures = std::iter::once(None).chain((0..depth).map(Some));

            for fail_at in failures {
                assert!(tracker.current().is_none());
                let result = catch_unwind(AssertUnwindSafe(|| {
                    tracker.track_while_executing(outer.clone(), || {
                        let inner = catch_unwind(AssertUnwindSafe(|| descend(&tracker, &chain, 0, fail_at)));
                        assert_eq!(inner.is_err(), fail_at.is_some());
                        Arc::ptr_eq(&tracker.current().unwrap(), &outer)
                    })
                }));
                assert_eq!(result.ok(), Some(true), "depth {depth}, failure at {fail_at:?}");
                assert!(tracker.current().is_none());
            }
        }
    }

    #[test]
    fn re_entering_the_same_context_keeps_it_installed() {
        let tracker = ContextTracker::<HttpSessionContext>::new();
        let session = Arc::new(HttpSessionContext::new("same"));

        tracker.track_while_executing(session.clone(), || {
            tracker.track_while_executing(session.clone(), || {
                assert!(Arc::ptr_eq(&tracker.current().unwrap(), &session));
            });
            assert!(Arc::ptr_eq(&tracker.current().unwrap(), &session));
        });
        assert!(tracker.current().is_none());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Concurrent production
// ─────────────────────────────────────────────────────────────────────────────

mod production {
    use super::*;

    struct Service {
        serial: usize,
    }

    #[test]
    fn one_producer_call_for_a_hundred_threads() {
        const THREADS: usize = 100;

        let scopes = ScopeModule::new();
        let produced = Arc::new(AtomicUsize::new(0));
        let counter = produced.clone();
        let provider: ScopedProvider<Service> = scopes.call().provider(Key::of::<Service>(), move || Service {
            serial: counter.fetch_add(1, Ordering::SeqCst),
        });

        let call = Arc::new(ContainerCallContext::http_request("GET", "/", None));
        let contexts = scopes.contexts_for(&call);
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let contexts = contexts.clone();
                let provider = provider.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    contexts.run(|| provider.get().unwrap())
                })
            })
            .collect();
        let services: Vec<Arc<Service>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(produced.load(Ordering::SeqCst), 1);
        assert!(services.iter().all(|s| Arc::ptr_eq(s, &services[0])));
        assert_eq!(services[0].serial, 0);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request and session sharing
// ─────────────────────────────────────────────────────────────────────────────

mod sharing {
    use super::*;

    struct RequestService;
    struct SessionService;

    #[derive(Default)]
    struct Seen {
        sessions: Vec<Arc<SessionService>>,
    }

    async fn get_with_cookie(app: &Router, cookie: Option<&str>) -> (String, Option<String>) {
        let mut request = Request::builder().uri("/work");
        if let Some(cookie) = cookie {
            request = request.header(header::COOKIE, cookie);
        }
        let response = app.clone().oneshot(request.body(Body::empty()).unwrap()).await.unwrap();
        let issued = response
            .headers()
            .get(header::SET_COOKIE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(';').next())
            .map(str::to_string);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (String::from_utf8(body.to_vec()).unwrap(), issued)
    }

    #[tokio::test]
    async fn request_and_session_instances_across_a_worker_thread() {
        let server = ServerContext::start(ServerConfig::default(), None);
        let scopes = server.scopes().clone();
        let request_service = scopes.call().provider(Key::of::<RequestService>(), || RequestService);
        let session_service = scopes.session().provider(Key::of::<SessionService>(), || SessionService);
        let seen = Arc::new(Mutex::new(Seen::default()));

        let record = seen.clone();
        let routes = Router::new().route(
            "/work",
            get(move || {
                let scopes = scopes.clone();
                let request_service = request_service.clone();
                let session_service = session_service.clone();
                let record = record.clone();
                async move {
                    let before = request_service.get()?;
                    record.lock().sessions.push(session_service.get()?);

                    let worker_service = request_service.clone();
                    let task = scopes.binder().wrap(move || worker_service.get());
                    let after = thread::spawn(task)
                        .join()
                        .map_err(|_| scope_core::ScopeError::TaskPanicked("worker".into()))??;

                    Ok::<_, ScopeRejection>(Arc::ptr_eq(&before, &after).to_string())
                }
            }),
        );
        let app = app(server, routes);

        let (same, cookie) = get_with_cookie(&app, None).await;
        assert_eq!(same, "true");
        let cookie = cookie.unwrap();
        let (same, _) = get_with_cookie(&app, Some(&cookie)).await;
        assert_eq!(same, "true");
        let (same, _) = get_with_cookie(&app, None).await;
        assert_eq!(same, "true");

        let seen = seen.lock();
        assert_eq!(seen.sessions.len(), 3);
        assert!(Arc::ptr_eq(&seen.sessions[0], &seen.sessions[1]));
        assert!(!Arc::ptr_eq(&seen.sessions[0], &seen.sessions[2]));
    }

    #[test]
    fn wrapping_with_nothing_active_stays_empty() {
        let scopes = ScopeModule::new();
        let task = scopes.binder().wrap({
            let scopes = scopes.clone();
            move || {
                (
                    scopes.call().current().is_err(),
                    scopes.connection().current().is_err(),
                    scopes.session().current().is_err(),
                )
            }
        });
        assert_eq!(thread::spawn(task).join().unwrap(), (true, true, true));
    }
}
