//! HTTP entry point for live pages.
//!
//! A plain GET renders the page statelessly: the session is loaded, the
//! socket mounted and rendered, and the HTML returned. A WebSocket upgrade on
//! the same URL turns the page live.
//!
//! Each first paint gets a fresh token on its root element. The client echoes
//! it when connecting, and the socket is diffed against exactly that snapshot.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE, LOCATION};
use hyper::{Request, Response, StatusCode, Uri};
use lru::LruCache;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::LiveError;
use crate::live::event::Params;
use crate::live::handler::Handler;
use crate::live::render::render_socket;
use crate::live::socket::Socket;
use crate::live::tree::Node;
use crate::serve::config::LiveConfig;
use crate::serve::constants::{FAVICON_PATH, RENDER_ATTR};
use crate::serve::websocket::{self, Connect};
use crate::session::{Session, SessionStore};

/// Serves a live handler over HTTP and WebSocket.
pub struct LiveService {
    handler: Arc<Handler>,
    store: Arc<dyn SessionStore>,
    config: Arc<LiveConfig>,
    /// Snapshots served over HTTP, waiting for their socket to connect.
    first_paint: Option<Mutex<LruCache<String, Node>>>,
}

impl LiveService {
    pub fn new(
        handler: Arc<Handler>,
        store: Arc<dyn SessionStore>,
        config: LiveConfig,
    ) -> Result<Self, LiveError> {
        config.validate()?;
        let first_paint =
            NonZeroUsize::new(config.first_paint_cache).map(|cap| Mutex::new(LruCache::new(cap)));
        Ok(Self {
            handler,
            store,
            config: Arc::new(config),
            first_paint,
        })
    }

    pub fn handler(&self) -> &Arc<Handler> {
        &self.handler
    }

    pub fn config(&self) -> &LiveConfig {
        &self.config
    }

    pub async fn handle<B>(
        &self,
        mut req: Request<B>,
    ) -> Result<Response<Full<Bytes>>, hyper::Error> {
        if req.uri().path() == FAVICON_PATH && self.ignores_favicon() {
            return Ok(status_response(StatusCode::NOT_FOUND, ""));
        }

        if hyper_tungstenite::is_upgrade_request(&req) {
            return Ok(self.upgrade(&mut req));
        }

        Ok(match self.render_page(&req) {
            Ok(response) => response,
            Err(e) => {
                warn!(path = %req.uri().path(), error = %e, "page render failed");
                self.handler.error_response(&e)
            }
        })
    }

    /// The stateless half: mount, params and render, then hand back HTML.
    fn render_page<B>(&self, req: &Request<B>) -> Result<Response<Full<Bytes>>, LiveError> {
        let session = match self.store.get(req.headers()) {
            Ok(session) => session,
            Err(e) if e.is_corrupt() => return self.repair_session(req, e.into()),
            Err(e) => return Err(e.into()),
        };

        let mut socket = Socket::new(session);
        self.handler.mount(&mut socket)?;
        self.handler.call_params(&mut socket, &self.page_params(req.uri()))?;
        let mut tree = render_socket(&self.handler, &socket)?;
        let token = (self.first_paint.is_some() && tree.as_element().is_some())
            .then(|| Uuid::new_v4().simple().to_string());
        if let Some(token) = &token {
            tree = tree.attr(RENDER_ATTR, token.as_str());
        }
        socket.update_render(tree.clone())?;

        let mut response = Response::new(Full::new(Bytes::from(tree.to_html())));
        self.store
            .save(response.headers_mut(), req.headers(), socket.session())?;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));

        if let Some(token) = token {
            self.remember_first_paint(self.first_paint_key(socket.session(), &token), tree);
        }
        Ok(response)
    }

    /// Clear a session that cannot be read and send the client back to the
    /// same URL once, marked so a second failure is reported instead.
    fn repair_session<B>(
        &self,
        req: &Request<B>,
        err: LiveError,
    ) -> Result<Response<Full<Bytes>>, LiveError> {
        if self.has_repair_marker(req.uri()) {
            return Err(err);
        }
        warn!(error = %err, "session corrupted, trying to repair");

        let location = format!("{}?{}", req.uri().path(), self.repair_query(req.uri().query()));
        let mut response = status_response(StatusCode::TEMPORARY_REDIRECT, "");
        self.store.clear(response.headers_mut(), req.headers())?;
        let location =
            HeaderValue::from_str(&location).map_err(|e| LiveError::config(e.to_string()))?;
        response.headers_mut().insert(LOCATION, location);
        Ok(response)
    }

    /// The live half: upgrade and hand the connection to its own task.
    fn upgrade<B>(&self, req: &mut Request<B>) -> Response<Full<Bytes>> {
        if self.handler.is_shut_down() {
            return status_response(StatusCode::SERVICE_UNAVAILABLE, "Server shutting down");
        }

        let session = match self.store.get(req.headers()) {
            Ok(session) => session,
            Err(e) => return self.handler.error_response(&e.into()),
        };
        let params = self.page_params(req.uri());
        let baseline = Params::from_query(req.uri().query())
            .get_str(RENDER_ATTR)
            .and_then(|token| self.take_first_paint(&self.first_paint_key(&session, token)));
        if baseline.is_none() {
            debug!("no first paint for connecting socket, will send a full render");
        }

        let (response, websocket) = match hyper_tungstenite::upgrade(&mut *req, None) {
            Ok(upgrade) => upgrade,
            Err(e) => {
                warn!(error = %e, "websocket upgrade failed");
                return status_response(
                    StatusCode::BAD_REQUEST,
                    &format!("WebSocket upgrade error: {}", e),
                );
            }
        };

        let handler = self.handler.clone();
        let config = self.config.clone();
        let cancel = handler.connection_token();
        tokio::spawn(async move {
            let ws = match websocket.await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!(error = %e, "websocket handshake failed");
                    return;
                }
            };
            let connect = Connect {
                session,
                params,
                baseline,
            };
            // Outcome is logged by the connection itself.
            let _ = websocket::serve_connection(handler, config, connect, ws, cancel).await;
        });

        response
    }

    fn ignores_favicon(&self) -> bool {
        self.config.ignore_favicon && self.handler.ignores_favicon()
    }

    fn page_params(&self, uri: &Uri) -> Params {
        let mut params = Params::from_query(uri.query());
        params.remove(&self.config.repair_param);
        params.remove(RENDER_ATTR);
        params
    }

    fn has_repair_marker(&self, uri: &Uri) -> bool {
        Params::from_query(uri.query())
            .get(&self.config.repair_param)
            .is_some()
    }

    /// The query with the repair marker set, other pairs kept as they came.
    fn repair_query(&self, query: Option<&str>) -> String {
        let mut pairs = self.query_without_marker(query);
        pairs.push(format!("{}=1", self.config.repair_param));
        pairs.join("&")
    }

    fn query_without_marker(&self, query: Option<&str>) -> Vec<String> {
        query
            .unwrap_or("")
            .split('&')
            .filter(|pair| !pair.is_empty())
            .filter(|pair| pair.split('=').next() != Some(self.config.repair_param.as_str()))
            .map(str::to_string)
            .collect()
    }

    fn first_paint_key(&self, session: &Session, token: &str) -> String {
        format!("{}|{}", session.id, token)
    }

    fn remember_first_paint(&self, key: String, tree: Node) {
        if let Some(cache) = &self.first_paint {
            cache.lock().unwrap_or_else(PoisonError::into_inner).put(key, tree);
        }
    }

    fn take_first_paint(&self, key: &str) -> Option<Node> {
        self.first_paint
            .as_ref()
            .and_then(|cache| cache.lock().unwrap_or_else(PoisonError::into_inner).pop(key))
    }
}

fn status_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::handler::{
        with_error, with_ignore_favicon, with_mount, with_params, with_render,
    };
    use crate::session::{CookieStore, SESSION_COOKIE};
    use http_body_util::BodyExt;
    use hyper::header::{COOKIE, SET_COOKIE};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn page_handler() -> Arc<Handler> {
        Arc::new(
            Handler::new([
                with_mount(|socket| {
                    socket.session_mut().set("visits", json!(1));
                    Ok(json!({"page": 1}))
                }),
                with_params(|_, params| Ok(json!({"page": params.get_int("page").unwrap_or(1)}))),
                with_render(|ctx| {
                    Ok(Node::element("p").child(Node::text(format!("page {}", ctx.assigns["page"]))))
                }),
            ])
            .unwrap(),
        )
    }

    fn service(handler: Arc<Handler>) -> LiveService {
        service_with(handler, LiveConfig::default())
    }

    fn service_with(handler: Arc<Handler>, config: LiveConfig) -> LiveService {
        let store = Arc::new(CookieStore::new(SESSION_COOKIE, b"http-test-key".to_vec()));
        LiveService::new(handler, store, config).unwrap()
    }

    fn cookie_of(response: &Response<Full<Bytes>>) -> HeaderValue {
        let set_cookie = response.headers()[SET_COOKIE].to_str().unwrap();
        HeaderValue::from_str(set_cookie.split(';').next().unwrap()).unwrap()
    }

    fn render_token(html: &str) -> String {
        let start = html.find(r#"live-render=""#).unwrap() + r#"live-render=""#.len();
        let len = html[start..].find('"').unwrap();
        html[start..start + len].to_string()
    }

    fn get(uri: &str) -> Request<()> {
        Request::get(uri).body(()).unwrap()
    }

    async fn body_text(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_favicon_is_ignored() {
        let response = service(page_handler()).handle(get("/favicon.ico")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let handler = Arc::new(
            Handler::new([
                with_ignore_favicon(false),
                with_render(|_| Ok(Node::element("p"))),
            ])
            .unwrap(),
        );
        let response = service(handler).handle(get("/favicon.ico")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_stateless_render() {
        let service = service(page_handler());
        let response = service.handle(get("/posts?page=3")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[CONTENT_TYPE],
            "text/html; charset=utf-8"
        );
        assert!(response.headers().contains_key(SET_COOKIE));
        let html = body_text(response).await;
        let token = render_token(&html);
        assert_eq!(html, format!(r#"<p live-render="{}">page 3</p>"#, token));
        assert_eq!(service.first_paint.as_ref().unwrap().lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_no_render_token_without_cache() {
        let service = service_with(
            page_handler(),
            LiveConfig {
                first_paint_cache: 0,
                ..LiveConfig::default()
            },
        );
        let response = service.handle(get("/posts?page=3")).await.unwrap();
        assert_eq!(body_text(response).await, "<p>page 3</p>");
    }

    #[tokio::test]
    async fn test_each_tab_gets_its_own_first_paint() {
        let renders = Arc::new(AtomicUsize::new(0));
        let counter = renders.clone();
        let handler = Arc::new(
            Handler::new([
                with_mount(move |_| Ok(json!({"n": counter.fetch_add(1, Ordering::SeqCst)}))),
                with_render(|ctx| {
                    Ok(Node::element("p").child(Node::text(ctx.assigns["n"].to_string())))
                }),
            ])
            .unwrap(),
        );
        let service = service(handler);

        let first = service.handle(get("/tabs")).await.unwrap();
        let cookie = cookie_of(&first);
        let first_html = body_text(first).await;

        let mut req = get("/tabs");
        req.headers_mut().insert(COOKIE, cookie.clone());
        let second_html = body_text(service.handle(req).await.unwrap()).await;

        let mut headers = hyper::HeaderMap::new();
        headers.insert(COOKIE, cookie);
        let session = service.store.get(&headers).unwrap();

        let first_token = render_token(&first_html);
        let second_token = render_token(&second_html);
        assert_ne!(first_token, second_token);

        let baseline = service
            .take_first_paint(&service.first_paint_key(&session, &first_token))
            .unwrap();
        assert_eq!(baseline.to_html(), first_html);
        assert_eq!(baseline.to_html(), format!(r#"<p live-render="{}">0</p>"#, first_token));
        assert!(service
            .take_first_paint(&service.first_paint_key(&session, &first_token))
            .is_none());

        let baseline = service
            .take_first_paint(&service.first_paint_key(&session, &second_token))
            .unwrap();
        assert_eq!(baseline.to_html(), second_html);
        assert_eq!(renders.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_render_token_is_not_a_page_param() {
        let service = service(page_handler());
        let uri: Uri = "/posts?page=2&live-render=abc&live-repair=1".parse().unwrap();
        let params = service.page_params(&uri);
        assert_eq!(params.get_int("page"), Some(2));
        assert!(params.get(RENDER_ATTR).is_none());
        assert!(params.get("live-repair").is_none());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let store = Arc::new(CookieStore::new(SESSION_COOKIE, b"http-test-key".to_vec()));
        let config = LiveConfig {
            outbound_capacity: 0,
            ..LiveConfig::default()
        };
        let err = LiveService::new(page_handler(), store, config).err().unwrap();
        assert!(matches!(err, LiveError::Config(_)));
    }

    #[tokio::test]
    async fn test_corrupt_session_redirects_once() {
        let service = service(page_handler());
        let mut req = get("/posts?page=2");
        req.headers_mut()
            .insert(COOKIE, HeaderValue::from_static("_ls=garbage"));
        let response = service.handle(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(response.headers()[LOCATION], "/posts?page=2&live-repair=1");
        let cleared = response.headers()[SET_COOKIE].to_str().unwrap();
        assert!(cleared.contains("Max-Age=0"));

        let mut req = get("/posts?page=2&live-repair=1");
        req.headers_mut()
            .insert(COOKIE, HeaderValue::from_static("_ls=garbage"));
        let response = service.handle(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_handler_failure_uses_error_handler() {
        let handler = Arc::new(
            Handler::new([
                with_mount(|_| Err("database down".into())),
                with_error(|err| status_response(StatusCode::BAD_GATEWAY, &err.to_string())),
            ])
            .unwrap(),
        );
        let response = service(handler).handle(get("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_text(response).await, "mount handler error: database down");
    }

    #[tokio::test]
    async fn test_missing_renderer_is_an_error() {
        let handler = Arc::new(Handler::new(Vec::new()).unwrap());
        let response = service(handler).handle(get("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_repair_query_replaces_marker() {
        let service = service(page_handler());
        assert_eq!(service.repair_query(None), "live-repair=1");
        assert_eq!(
            service.repair_query(Some("a=1&live-repair=0&b=2")),
            "a=1&b=2&live-repair=1"
        );
    }
}
