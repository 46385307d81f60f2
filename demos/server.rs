//! Demo server: users and their posts behind resource routes, with a local login.
//! Uses Postgres when DATABASE_URL is set, the in-memory backend otherwise.

use railcar::auth::RequireLogin;
use railcar::controller::{action_fn, RespondOptions};
use railcar::orm::{FieldDef, FieldType};
use railcar::{
    App, AppError, Backend, ControllerDef, FnRenderer, LocalStrategy, MemoryBackend, ModelDef, PgBackend,
    ResourceStyle, Schema, Settings,
};
use axum::http::StatusCode;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn users_controller() -> ControllerDef {
    ControllerDef::new("Users")
        .action(
            "index",
            action_fn(|ctx| {
                Box::pin(async move {
                    let users = ctx.model("User")?.all().await?;
                    ctx.respond(&users, RespondOptions::default()).await
                })
            }),
        )
        .action(
            "count",
            action_fn(|ctx| {
                Box::pin(async move {
                    let n = ctx.model("User")?.count().await?;
                    ctx.respond(json!({ "count": n }), RespondOptions::default()).await
                })
            }),
        )
        .action(
            "show",
            action_fn(|ctx| {
                Box::pin(async move {
                    let id = ctx.param("id").cloned().unwrap_or(Value::Null);
                    match ctx.model("User")?.find(id).await? {
                        Some(user) => ctx.respond(&user, RespondOptions::default()).await,
                        None => {
                            ctx.not_found("no such user").await;
                            Ok(())
                        }
                    }
                })
            }),
        )
        .action(
            "create",
            action_fn(|ctx| {
                Box::pin(async move {
                    let data = ctx.request.body.clone();
                    let user = ctx.model("User")?.create(data).await?;
                    ctx.respond_status(StatusCode::CREATED, &user).await
                })
            }),
        )
        .action(
            "update",
            action_fn(|ctx| {
                Box::pin(async move {
                    let id = ctx.param("id").cloned().unwrap_or(Value::Null);
                    let data = ctx.request.body.clone();
                    match ctx.model("User")?.update(id, data).await? {
                        Some(user) => ctx.respond(&user, RespondOptions::default()).await,
                        None => {
                            ctx.not_found("no such user").await;
                            Ok(())
                        }
                    }
                })
            }),
        )
        .action(
            "destroy",
            action_fn(|ctx| {
                Box::pin(async move {
                    let id = ctx.param("id").cloned().unwrap_or(Value::Null);
                    let users = ctx.model("User")?;
                    let gone = users.destroy(id.clone()).await?;
                    users.un_cached(&id);
                    ctx.respond(json!({ "destroyed": gone }), RespondOptions::default()).await
                })
            }),
        )
        .action(
            "posts",
            action_fn(|ctx| {
                Box::pin(async move {
                    let id = ctx.param("id").cloned().unwrap_or(Value::Null);
                    let Some(user) = ctx.model("User")?.find(id).await? else {
                        ctx.not_found("no such user").await;
                        return Ok(());
                    };
                    let posts = user.has_many(&ctx.model("Post")?).all().await?;
                    ctx.respond(&posts, RespondOptions::default()).await
                })
            }),
        )
        .access_control(RequireLogin::default())
        .responds_with(&["json", "html", "xml", "txt"])
}

fn session_controller() -> ControllerDef {
    ControllerDef::new("Session")
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
        .responds_with(&["json", "txt"])
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("railcar=info".parse()?))
        .init();

    let settings = Settings::from_env()?;
    let backend: Arc<dyn Backend> = match &settings.database_url {
        Some(url) => Arc::new(PgBackend::connect(url).await?),
        None => {
            tracing::warn!("DATABASE_URL not set; using the in-memory backend");
            Arc::new(MemoryBackend::new())
        }
    };
    let schema = Schema::from_settings(&settings, backend);
    schema.define(
        ModelDef::new("User")
            .table("users")
            .field(FieldDef::new("id", FieldType::Serial))
            .field(FieldDef::new("name", FieldType::String))
            .field(FieldDef::new("email", FieldType::String))
            .timestamps(),
    )?;
    schema.define(
        ModelDef::new("Post")
            .table("posts")
            .field(FieldDef::new("id", FieldType::Serial))
            .field(FieldDef::new("user_id", FieldType::Integer))
            .field(FieldDef::new("title", FieldType::String)),
    )?;
    schema.sync().await?;

    let app = App::new(settings)
        .routes(|r| {
            r.resource("users", "Users", ResourceStyle::Both)?;
            r.get("/users/:id/posts(.:format)", "Users#posts")?.named("users.posts")?;
            r.post("/login", "Session#login")?.named("login")?;
            r.post("/logout", "Session#logout")?.named("logout")?;
            Ok(())
        })?
        .controller(users_controller().action(
            "add",
            action_fn(|ctx| Box::pin(async move { ctx.respond(json!({}), RespondOptions::default()).await })),
        ).action(
            "edit",
            action_fn(|ctx| Box::pin(async move { ctx.respond(json!({}), RespondOptions::default()).await })),
        ))
        .controller(session_controller())
        .renderer(
            "html",
            FnRenderer(|template: &str, data: &Value, _: &railcar::render::Helpers| {
                Ok(format!("<h1>{}</h1><pre>{}</pre>", template, data).into_bytes())
            }),
        )
        .strategy(
            "local",
            LocalStrategy::new(|username, password| async move {
                if username == "admin" && password == "admin" {
                    Ok(Some(json!({ "name": username })))
                } else {
                    Ok(None)
                }
            }),
        )
        .schema(schema);

    app.serve().await?;
    Ok(())
}
