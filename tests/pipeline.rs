use axum::body::Body;
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use railcar::auth::RequireLogin;
use railcar::controller::{action_fn, filter_fn, Action, ControllerDef, Flow, RespondOptions};
use railcar::{App, AppError, FnRenderer, LocalStrategy, MemorySessionStore, ResourceStyle, Settings};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tower::ServiceExt;

#[derive(Clone, Default)]
struct Counters {
    first_filter: Arc<AtomicUsize>,
    second_filter: Arc<AtomicUsize>,
    action: Arc<AtomicUsize>,
    after: Arc<AtomicUsize>,
}

fn echo() -> impl Action {
    action_fn(|ctx| {
        Box::pin(async move {
            let body = json!({ "action": ctx.action(), "id": ctx.param("id") });
            ctx.respond(body, RespondOptions::default()).await
        })
    })
}

fn things() -> ControllerDef {
    let mut def = ControllerDef::new("Things").responds_with(&["json", "xml", "txt"]);
    for action in ["index", "count", "add", "create", "show", "edit", "update", "destroy"] {
        def = def.action(action, echo());
    }
    def
}

fn users() -> ControllerDef {
    ControllerDef::new("User").action(
        "show",
        action_fn(|ctx| {
            Box::pin(async move {
                let params = ctx.route_params().clone();
                ctx.respond(&params, RespondOptions::default()).await
            })
        }),
    )
}

fn guarded(counters: &Counters) -> ControllerDef {
    let first = counters.first_filter.clone();
    let second = counters.second_filter.clone();
    let action = counters.action.clone();
    ControllerDef::new("Guarded")
        .responds_with(&["json"])
        .before_all(filter_fn(move |ctx| {
            let first = first.clone();
            Box::pin(async move {
                first.fetch_add(1, Ordering::SeqCst);
                if ctx.param("let_in").is_none() {
                    ctx.respond_status(StatusCode::UNAUTHORIZED, json!({ "denied": true })).await?;
                }
                Ok(Flow::Continue)
            })
        }))
        .before_all(filter_fn(move |_ctx| {
            let second = second.clone();
            Box::pin(async move {
                second.fetch_add(1, Ordering::SeqCst);
                Ok(Flow::Continue)
            })
        }))
        .before_only(
            &["secret"],
            filter_fn(|_ctx| Box::pin(async { Ok(Flow::abort(StatusCode::FORBIDDEN, json!({ "secret": "no" }))) })),
        )
        .action(
            "index",
            action_fn(move |ctx| {
                let action = action.clone();
                Box::pin(async move {
                    action.fetch_add(1, Ordering::SeqCst);
                    ctx.respond(json!({ "ran": true }), RespondOptions::default()).await
                })
            }),
        )
        .action("secret", echo())
}

fn misc(counters: &Counters) -> ControllerDef {
    let after = counters.after.clone();
    ControllerDef::new("Misc")
        .responds_with(&["json", "txt"])
        .after_all(filter_fn(move |_ctx| {
            let after = after.clone();
            Box::pin(async move {
                after.fetch_add(1, Ordering::SeqCst);
                Ok(Flow::Continue)
            })
        }))
        .action(
            "twice",
            action_fn(|ctx| {
                Box::pin(async move {
                    ctx.output(StatusCode::OK, "text/plain", b"first".to_vec()).await;
                    ctx.output(StatusCode::OK, "text/plain", b"second".to_vec()).await;
                    Ok(())
                })
            }),
        )
        .action(
            "broken",
            action_fn(|_ctx| Box::pin(async { Err(AppError::Internal("kaput".into())) })),
        )
        .action("silent", action_fn(|_ctx| Box::pin(async { Ok(()) })))
        .action(
            "where",
            action_fn(|ctx| {
                Box::pin(async move {
                    let filter = ctx.json_param("where")?;
                    ctx.respond(json!({ "where": filter }), RespondOptions::default()).await
                })
            }),
        )
}

fn session() -> ControllerDef {
    ControllerDef::new("Session")
        .responds_with(&["json"])
        .action(
            "login",
            action_fn(|ctx| {
                Box::pin(async move {
                    match ctx.authenticate("local").await? {
                        Some(user) => ctx.respond(json!({ "user": user }), RespondOptions::default()).await,
                        None => Err(AppError::Auth("invalid credentials".into())),
                    }
                })
            }),
        )
        .action(
            "logout",
            action_fn(|ctx| {
                Box::pin(async move {
                    ctx.logout();
                    ctx.respond(json!({ "ok": true }), RespondOptions::default()).await
                })
            }),
        )
}

fn account(login_url: Option<&str>, name: &str) -> ControllerDef {
    ControllerDef::new(name)
        .responds_with(&["json"])
        .access_control(RequireLogin {
            login_url: login_url.map(String::from),
        })
        .action(
            "me",
            action_fn(|ctx| {
                Box::pin(async move {
                    let user = ctx.current_user();
                    ctx.respond(json!({ "user": user }), RespondOptions::default()).await
                })
            }),
        )
}

fn build(settings: Settings, counters: &Counters) -> axum::Router {
    build_with_store(settings, counters, Arc::new(MemorySessionStore::new()))
}

fn build_with_store(settings: Settings, counters: &Counters, store: Arc<MemorySessionStore>) -> axum::Router {
    App::new(settings)
        .session_store(store)
        .routes(|r| {
            r.resource("things", "Things", ResourceStyle::Both)?;
            r.get("/user/:id(.:format)", "User#show")?.named("user")?;
            r.get("/guarded/:action", "Guarded")?;
            r.get("/misc/:action(.:format)", "Misc")?;
            r.get("/dyn/:action", "Things")?;
            r.get("/:controller/go", "#index")?;
            r.post("/login", "Session#login")?;
            r.post("/logout", "Session#logout")?;
            r.get("/me", "Account#me")?;
            r.get("/inbox", "Inbox#me")?;
            Ok(())
        })
        .unwrap()
        .controller(things())
        .controller(users())
        .controller(guarded(counters))
        .controller(misc(counters))
        .controller(session())
        .controller(account(None, "Account"))
        .controller(account(Some("/login"), "Inbox"))
        .renderer(
            "html",
            FnRenderer(|template: &str, data: &Value, _: &railcar::render::Helpers| {
                Ok(format!("<p>{}</p>{}", template, data).into_bytes())
            }),
        )
        .strategy(
            "local",
            LocalStrategy::new(|username, password| async move {
                Ok((password == "secret").then(|| json!({ "name": username })))
            }),
        )
        .into_router()
        .unwrap()
}

fn app() -> (axum::Router, Counters) {
    let counters = Counters::default();
    (build(Settings::default(), &counters), counters)
}

async fn send(app: &axum::Router, req: Request<Body>) -> (StatusCode, HeaderMap, String) {
    let res = app.clone().oneshot(req).await.unwrap();
    let status = res.status();
    let headers = res.headers().clone();
    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    (status, headers, String::from_utf8_lossy(&bytes).into_owned())
}

fn get(uri: &str, accept: Option<&str>) -> Request<Body> {
    let mut b = Request::builder().uri(uri);
    if let Some(a) = accept {
        b = b.header(header::ACCEPT, a);
    }
    b.body(Body::empty()).unwrap()
}

fn json_body(body: &str) -> Value {
    serde_json::from_str(body).unwrap()
}

fn content_type(h: &HeaderMap) -> &str {
    h.get(header::CONTENT_TYPE).unwrap().to_str().unwrap()
}

#[tokio::test]
async fn both_resource_styles_reach_update() {
    let (app, _) = app();
    let (status, _, body) = send(&app, get("/things/5/update", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body), json!({ "action": "update", "id": "5" }));

    let put = Request::builder().method(Method::PUT).uri("/things/5").body(Body::empty()).unwrap();
    let (status, _, body) = send(&app, put).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body), json!({ "action": "update", "id": "5" }));

    let overridden = Request::builder()
        .method(Method::POST)
        .uri("/things/5")
        .header("x-http-method-override", "DELETE")
        .body(Body::empty())
        .unwrap();
    let (_, _, body) = send(&app, overridden).await;
    assert_eq!(json_body(&body)["action"], "destroy");
}

#[tokio::test]
async fn format_suffix_lands_in_params() {
    let (app, _) = app();
    let (status, headers, body) = send(&app, get("/user/42.json", Some("text/html"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type(&headers), "application/json; charset=utf-8");
    assert_eq!(
        json_body(&body),
        json!({ "id": "42", "format": "json", "controller": "User", "action": "show" })
    );
}

#[tokio::test]
async fn accept_header_negotiation() {
    let (app, _) = app();
    let (_, headers, body) = send(&app, get("/user/42", Some("application/json"))).await;
    assert_eq!(content_type(&headers), "application/json; charset=utf-8");
    assert_eq!(json_body(&body)["id"], "42");

    let (_, headers, body) = send(&app, get("/user/42", Some("*/*"))).await;
    assert_eq!(content_type(&headers), "text/html; charset=utf-8");
    assert!(body.starts_with("<p>user/show</p>"));

    let (status, _, _) = send(&app, get("/user/42", Some("image/png"))).await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);

    let (status, _, _) = send(&app, get("/user/42.pdf", None)).await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);

    let (_, headers, body) = send(&app, get("/things.xml", None)).await;
    assert_eq!(content_type(&headers), "application/xml; charset=utf-8");
    assert!(body.contains("<action>index</action>"));
}

#[tokio::test]
async fn head_requests_have_no_body() {
    let (app, _) = app();
    let req = Request::builder().method(Method::HEAD).uri("/user/1").body(Body::empty()).unwrap();
    let (status, headers, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers.contains_key(header::CONTENT_TYPE));
    assert!(body.is_empty());
}

#[tokio::test]
async fn responding_filter_skips_the_action() {
    let (app, counters) = app();
    let (status, _, body) = send(&app, get("/guarded/index", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(&body), json!({ "denied": true }));
    assert_eq!(counters.first_filter.load(Ordering::SeqCst), 1);
    assert_eq!(counters.second_filter.load(Ordering::SeqCst), 0);
    assert_eq!(counters.action.load(Ordering::SeqCst), 0);

    let (status, _, _) = send(&app, get("/guarded/index?let_in=1", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(counters.second_filter.load(Ordering::SeqCst), 1);
    assert_eq!(counters.action.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn aborting_filter_sends_its_reply() {
    let (app, _) = app();
    let (status, _, body) = send(&app, get("/guarded/secret?let_in=1", None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(json_body(&body), json!({ "secret": "no" }));
}

#[tokio::test]
async fn output_is_sent_once() {
    let (app, counters) = app();
    let (status, _, body) = send(&app, get("/misc/twice", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "first");
    assert_eq!(counters.after.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn action_errors_are_negotiated() {
    let (app, _) = app();
    let (status, _, body) = send(&app, get("/misc/broken", Some("application/json"))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let err = &json_body(&body)["error"];
    assert_eq!(err["type"], "UncaughtException");
    assert_eq!(err["code"], 500);

    let (status, headers, body) = send(&app, get("/misc/broken", Some("text/plain"))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(content_type(&headers), "text/plain; charset=utf-8");
    assert_eq!(body, "internal: kaput");

    let (status, _, _) = send(&app, get("/misc/silent", None)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn routing_failures_are_404() {
    let (app, _) = app();
    let (status, _, body) = send(&app, get("/nowhere/at/all", None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json_body(&body)["error"]["message"], "Route not found");

    let (status, _, body) = send(&app, get("/nowhere/at/all", Some("text/plain"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, "Route not found");

    let (status, _, body) = send(&app, get("/Ghost/go", None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json_body(&body)["error"]["message"], "Controller class not found: Ghost");

    let (status, _, body) = send(&app, get("/dyn/nope", None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json_body(&body)["error"]["type"], "RoutingError");
}

#[tokio::test]
async fn anonymous_requests_leave_no_session_behind() {
    let store = Arc::new(MemorySessionStore::new());
    let app = build_with_store(Settings::default(), &Counters::default(), store.clone());
    for _ in 0..50 {
        let (status, headers, _) = send(&app, get("/nowhere", None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(headers.get(header::SET_COOKIE).is_none());
    }
    let (status, headers, _) = send(&app, get("/things", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers.get(header::SET_COOKIE).is_none());
    assert_eq!(store.len(), 0);

    let login = Request::builder()
        .method(Method::POST)
        .uri("/login")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"username":"ann","password":"secret"}"#))
        .unwrap();
    let (status, headers, _) = send(&app, login).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers.get(header::SET_COOKIE).is_some());
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn malformed_input_is_a_validation_error() {
    let (app, _) = app();
    let req = Request::builder()
        .method(Method::POST)
        .uri("/things")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{broken"))
        .unwrap();
    let (status, _, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json_body(&body)["error"]["type"], "ValidationError");

    let (status, _, body) = send(&app, get("/misc/where?where=%7B%22a%22%3A1%7D", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body), json!({ "where": { "a": 1 } }));

    let (status, _, _) = send(&app, get("/misc/where?where=%7Bnope", None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

fn session_cookie(headers: &HeaderMap) -> String {
    let raw = headers.get(header::SET_COOKIE).unwrap().to_str().unwrap();
    raw.split(';').next().unwrap().to_string()
}

#[tokio::test]
async fn login_is_kept_in_the_session() {
    let (app, _) = app();
    let (status, _, _) = send(&app, get("/me", None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let login = Request::builder()
        .method(Method::POST)
        .uri("/login")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from("username=ann&password=secret"))
        .unwrap();
    let (status, headers, body) = send(&app, login).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body), json!({ "user": { "name": "ann" } }));
    let cookie = session_cookie(&headers);
    assert!(cookie.starts_with("railcar.sid="));

    let me = Request::builder().uri("/me").header(header::COOKIE, &cookie).body(Body::empty()).unwrap();
    let (status, _, body) = send(&app, me).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body), json!({ "user": { "name": "ann" } }));

    let logout = Request::builder()
        .method(Method::POST)
        .uri("/logout")
        .header(header::COOKIE, &cookie)
        .body(Body::empty())
        .unwrap();
    send(&app, logout).await;
    let me = Request::builder().uri("/me").header(header::COOKIE, &cookie).body(Body::empty()).unwrap();
    let (status, _, _) = send(&app, me).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn bad_credentials_are_401_and_denied_pages_redirect() {
    let (app, _) = app();
    let login = Request::builder()
        .method(Method::POST)
        .uri("/login")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"username":"ann","password":"wrong"}"#))
        .unwrap();
    let (status, _, body) = send(&app, login).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(&body)["error"]["type"], "AuthenticationError");

    let (status, headers, _) = send(&app, get("/inbox", None)).await;
    assert_eq!(status, StatusCode::FOUND);
    assert_eq!(headers[header::LOCATION], "/login");
}

#[tokio::test]
async fn cors_headers_and_preflight() {
    let counters = Counters::default();
    let settings = Settings {
        cors_origin: Some("https://app.example".into()),
        ..Settings::default()
    };
    let app = build(settings, &counters);

    let (status, headers, _) = send(&app, get("/things", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "https://app.example");

    let preflight = Request::builder().method(Method::OPTIONS).uri("/things/5").body(Body::empty()).unwrap();
    let (status, headers, body) = send(&app, preflight).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(body.is_empty());
    let allow = headers[header::ALLOW].to_str().unwrap();
    assert!(allow.contains("PUT") && allow.contains("DELETE"));
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "https://app.example");
}

#[tokio::test]
async fn removed_routes_stop_matching() {
    let state = App::new(Settings::default())
        .routes(|r| {
            r.get("/user/:id", "User#show")?.named("user")?;
            Ok(())
        })
        .unwrap()
        .controller(users())
        .build()
        .unwrap();
    let app = railcar::router_for(state.clone(), 1024);
    let (status, _, _) = send(&app, get("/user/1", Some("application/json"))).await;
    assert_eq!(status, StatusCode::OK);

    assert!(state.router.write().remove("user").is_some());
    let (status, _, _) = send(&app, get("/user/1", Some("application/json"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
