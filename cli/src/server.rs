use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Context;
use axum::{
    Extension, Json, Router,
    extract::{
        DefaultBodyLimit, FromRequest, Multipart, Path, Query, Request, State,
        rejection::JsonRejection,
    },
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use chrono::Local;
use serde::{Deserialize, Deserializer, Serialize};
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

use potluck_core::cms_import::{CmsExport, import_cms};
use potluck_core::db::Database;
use potluck_core::error::StoreError;
use potluck_core::filter::RecipeQuery;
use potluck_core::import::{CsvSources, import_csv};
use potluck_core::models::{
    GroupKind, MealSlot, NewTagGroup, RecipeDetail, RecipeListing, UpdateTagGroup, User,
    UserRole, hash_token, validate_name,
};
use potluck_core::service::{self, RecipeForm};

const BODY_LIMIT: usize = 10 * 1024 * 1024; // 10 MB

#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Database>>,
    /// Set in `--no-auth` mode: every request acts as this user.
    local_user: Option<User>,
}

impl AppState {
    fn db(&self) -> MutexGuard<'_, Database> {
        self.db
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

// --- Request / Response types ---

fn deserialize_some<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

#[derive(Deserialize)]
struct RecipeParams {
    tags: Option<String>,
    search: Option<String>,
}

impl RecipeParams {
    fn query(&self) -> RecipeQuery {
        RecipeQuery::from_params(self.tags.as_deref(), self.search.as_deref())
    }
}

#[derive(Deserialize)]
struct MonthParams {
    month: Option<String>,
}

#[derive(Deserialize)]
struct ScheduleRequest {
    recipe_id: i64,
    notes: Option<String>,
}

#[derive(Deserialize)]
struct CreateTagGroupRequest {
    name: String,
    #[serde(default)]
    display_order: i64,
    kind: Option<GroupKind>,
}

#[derive(Deserialize)]
#[allow(clippy::option_option)]
struct UpdateTagGroupRequest {
    name: Option<String>,
    display_order: Option<i64>,
    #[serde(default, deserialize_with = "deserialize_some")]
    kind: Option<Option<GroupKind>>,
}

#[derive(Deserialize)]
struct CreateTagRequest {
    tag_group_id: i64,
    name: String,
}

#[derive(Deserialize)]
struct RenameTagRequest {
    name: String,
}

#[derive(Serialize)]
struct FavoriteStatus {
    recipe_id: i64,
    favorite: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CsvImportResponse {
    success: bool,
    message: String,
    tag_groups: potluck_core::import::StageSummary,
    tags: potluck_core::import::StageSummary,
    recipes: potluck_core::import::StageSummary,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// --- Error handling ---

enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    Conflict(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            Self::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg),
            Self::Internal(err) => {
                tracing::error!("Internal server error: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match StoreError::find(&err) {
            Some(StoreError::NotFound(msg)) => Self::NotFound(msg.clone()),
            Some(StoreError::Conflict(msg)) => Self::Conflict(msg.clone()),
            Some(StoreError::Invalid(msg)) => Self::BadRequest(msg.clone()),
            None => Self::Internal(err),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

/// `Json` whose rejections use the `{"error": ...}` body.
struct ApiJson<T>(T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(request: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(request, state).await?;
        Ok(Self(value))
    }
}

// --- Middleware ---

/// Resolve the bearer token to a user and attach it to the request.
async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let user = if let Some(user) = &state.local_user {
        user.clone()
    } else {
        let token = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty());
        let found = match token {
            Some(token) => state
                .db()
                .get_user_by_token_hash(&hash_token(token))
                .context("token lookup")?,
            None => None,
        };
        found.ok_or_else(|| ApiError::Unauthorized("Invalid or missing API token".to_string()))?
    };

    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

fn check_role(request: &Request, required: UserRole) -> Result<(), ApiError> {
    let role = request
        .extensions()
        .get::<User>()
        .map(|u| u.role)
        .ok_or_else(|| ApiError::Unauthorized("Authentication required".to_string()))?;
    if !role.allows(required) {
        return Err(ApiError::Forbidden(format!("Requires {required} role")));
    }
    Ok(())
}

async fn require_contributor(request: Request, next: Next) -> Result<Response, ApiError> {
    check_role(&request, UserRole::Contributor)?;
    Ok(next.run(request).await)
}

async fn require_admin(request: Request, next: Next) -> Result<Response, ApiError> {
    check_role(&request, UserRole::Admin)?;
    Ok(next.run(request).await)
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}

// --- Public handlers ---

async fn list_recipes(
    State(state): State<AppState>,
    Query(params): Query<RecipeParams>,
) -> Result<Json<Vec<RecipeListing>>, ApiError> {
    let recipes = service::browse_recipes(&state.db(), &params.query())?;
    Ok(Json(recipes))
}

async fn get_recipe_page(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<RecipeDetail>, ApiError> {
    Ok(Json(service::recipe_page(&state.db(), &slug)?))
}

async fn list_tag_groups(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let groups = state.db().list_tag_groups_with_tags()?;
    Ok(Json(
        serde_json::to_value(groups).context("failed to serialize tag groups")?,
    ))
}

// --- Signed-in handlers ---

async fn get_me(Extension(user): Extension<User>) -> Json<User> {
    Json(user)
}

async fn list_favorites(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Query(params): Query<RecipeParams>,
) -> Result<Json<Vec<RecipeListing>>, ApiError> {
    let recipes = service::favorite_recipes(&state.db(), user.id, &params.query())?;
    Ok(Json(recipes))
}

async fn get_favorite(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(recipe_id): Path<i64>,
) -> Result<Json<FavoriteStatus>, ApiError> {
    let favorite = state.db().is_favorite(user.id, recipe_id)?;
    Ok(Json(FavoriteStatus {
        recipe_id,
        favorite,
    }))
}

async fn add_favorite(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(recipe_id): Path<i64>,
) -> Result<Json<FavoriteStatus>, ApiError> {
    state.db().add_favorite(user.id, recipe_id)?;
    Ok(Json(FavoriteStatus {
        recipe_id,
        favorite: true,
    }))
}

async fn remove_favorite(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(recipe_id): Path<i64>,
) -> Result<Json<FavoriteStatus>, ApiError> {
    state.db().remove_favorite(user.id, recipe_id)?;
    Ok(Json(FavoriteStatus {
        recipe_id,
        favorite: false,
    }))
}

async fn get_calendar(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Query(params): Query<MonthParams>,
) -> Result<Json<service::MonthCalendar>, ApiError> {
    let month = match params.month.as_deref() {
        Some(m) => service::parse_month(m)?,
        None => Local::now().date_naive(),
    };
    Ok(Json(service::month_calendar(&state.db(), user.id, month)?))
}

async fn schedule_slot(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path((date, meal)): Path<(String, String)>,
    ApiJson(req): ApiJson<ScheduleRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let date = service::parse_date(&date)?;
    let meal: MealSlot = meal.parse()?;
    let entry =
        service::schedule_recipe(&state.db(), user.id, date, meal, req.recipe_id, req.notes)?;
    Ok(Json(
        serde_json::to_value(entry).context("failed to serialize calendar entry")?,
    ))
}

async fn next_slot(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(date): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let date = service::parse_date(&date)?;
    let meal = service::next_open_slot(&state.db(), user.id, date)?;
    Ok(Json(serde_json::json!({
        "date": date.format("%Y-%m-%d").to_string(),
        "meal_type": meal,
    })))
}

async fn delete_calendar_entry(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    service::unschedule(&state.db(), user.id, id)?;
    Ok(StatusCode::NO_CONTENT)
}

// --- Contributor handlers ---

async fn admin_list_recipes(
    State(state): State<AppState>,
    Query(params): Query<RecipeParams>,
) -> Result<Json<Vec<RecipeListing>>, ApiError> {
    let recipes = service::admin_browse_recipes(&state.db(), &params.query())?;
    Ok(Json(recipes))
}

async fn admin_create_recipe(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    ApiJson(form): ApiJson<RecipeForm>,
) -> Result<(StatusCode, Json<RecipeDetail>), ApiError> {
    let new = form.into_new_recipe(Some(user.id))?;
    let db = state.db();
    let recipe = db.insert_recipe(&new)?;
    tracing::info!(slug = %recipe.slug, user = %user.email, "recipe created");
    Ok((StatusCode::CREATED, Json(service::recipe_page(&db, &recipe.slug)?)))
}

async fn admin_get_recipe(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<RecipeDetail>, ApiError> {
    let db = state.db();
    let recipe = db.get_recipe(id)?;
    Ok(Json(service::recipe_page(&db, &recipe.slug)?))
}

async fn admin_update_recipe(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    ApiJson(form): ApiJson<RecipeForm>,
) -> Result<Json<RecipeDetail>, ApiError> {
    let db = state.db();
    let existing = db.get_recipe(id)?;
    let new = form.into_new_recipe(existing.created_by)?;
    let recipe = db.update_recipe(id, &new)?;
    Ok(Json(service::recipe_page(&db, &recipe.slug)?))
}

async fn admin_delete_recipe(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    if state.db().delete_recipe(id)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("Recipe {id} not found")))
    }
}

async fn create_tag_group(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<CreateTagGroupRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let name = validate_name("Tag group", &req.name)?;
    let group = state.db().insert_tag_group(&NewTagGroup {
        name,
        display_order: req.display_order,
        kind: req.kind,
    })?;
    let value = serde_json::to_value(group).context("failed to serialize tag group")?;
    Ok((StatusCode::CREATED, Json(value)))
}

async fn update_tag_group(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    ApiJson(req): ApiJson<UpdateTagGroupRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if req.name.is_none() && req.display_order.is_none() && req.kind.is_none() {
        return Err(ApiError::BadRequest(
            "At least one field must be provided".to_string(),
        ));
    }
    let name = req
        .name
        .as_deref()
        .map(|n| validate_name("Tag group", n))
        .transpose()?;
    let group = state.db().update_tag_group(
        id,
        &UpdateTagGroup {
            name,
            display_order: req.display_order,
            kind: req.kind,
        },
    )?;
    Ok(Json(
        serde_json::to_value(group).context("failed to serialize tag group")?,
    ))
}

async fn delete_tag_group(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    if state.db().delete_tag_group(id)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("Tag group {id} not found")))
    }
}

async fn create_tag(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<CreateTagRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let name = validate_name("Tag", &req.name)?;
    let tag = state.db().insert_tag(req.tag_group_id, &name)?;
    let value = serde_json::to_value(tag).context("failed to serialize tag")?;
    Ok((StatusCode::CREATED, Json(value)))
}

async fn rename_tag(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    ApiJson(req): ApiJson<RenameTagRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let name = validate_name("Tag", &req.name)?;
    let tag = state.db().rename_tag(id, &name)?;
    Ok(Json(serde_json::to_value(tag).context("failed to serialize tag")?))
}

async fn delete_tag(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    if state.db().delete_tag(id)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("Tag {id} not found")))
    }
}

// --- Admin handlers ---

async fn import_csv_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<CsvImportResponse>, ApiError> {
    let mut sources = CsvSources::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Multipart error: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let text = field
            .text()
            .await
            .map_err(|e| ApiError::BadRequest(format!("Read error: {e}")))?;
        match name.as_str() {
            "tagGroups" => sources.tag_groups = Some(text),
            "tags" => sources.tags = Some(text),
            "recipes" => sources.recipes = Some(text),
            _ => {}
        }
    }

    if sources.tag_groups.is_none() || sources.tags.is_none() || sources.recipes.is_none() {
        return Err(ApiError::BadRequest(
            "Missing CSV files. Please upload tagGroups, tags, and recipes files.".to_string(),
        ));
    }

    let summary = import_csv(&state.db(), &sources)
        .map_err(|e| ApiError::BadRequest(format!("{e:#}")))?;
    let stage = |s: Option<potluck_core::import::StageSummary>| s.unwrap_or_default();
    let (groups, tags, recipes) = (
        stage(summary.tag_groups),
        stage(summary.tags),
        stage(summary.recipes),
    );
    Ok(Json(CsvImportResponse {
        success: true,
        message: format!(
            "Imported {} tag groups, {} tags and {} recipes",
            groups.created, tags.created, recipes.created
        ),
        tag_groups: groups,
        tags,
        recipes,
    }))
}

async fn import_cms_export(
    State(state): State<AppState>,
    ApiJson(export): ApiJson<CmsExport>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let summary = import_cms(&state.db(), &export)?;
    Ok(Json(serde_json::json!({ "success": true, "summary": summary })))
}

async fn backfill_ingredients(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let summary = state.db().backfill_structured_ingredients()?;
    Ok(Json(
        serde_json::to_value(summary).context("failed to serialize summary")?,
    ))
}

fn build_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/api/recipes", get(list_recipes))
        .route("/api/recipes/{slug}", get(get_recipe_page))
        .route("/api/tag-groups", get(list_tag_groups));

    let signed_in = Router::new()
        .route("/api/me", get(get_me))
        .route("/api/favorites", get(list_favorites))
        .route(
            "/api/favorites/{recipe_id}",
            get(get_favorite).put(add_favorite).delete(remove_favorite),
        )
        .route("/api/calendar", get(get_calendar))
        .route("/api/calendar/{date}/{meal}", put(schedule_slot))
        .route("/api/calendar/{date}/next-slot", get(next_slot))
        .route(
            "/api/calendar/entries/{id}",
            axum::routing::delete(delete_calendar_entry),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let contributor = Router::new()
        .route(
            "/api/admin/recipes",
            get(admin_list_recipes).post(admin_create_recipe),
        )
        .route(
            "/api/admin/recipes/{id}",
            get(admin_get_recipe)
                .put(admin_update_recipe)
                .delete(admin_delete_recipe),
        )
        .route("/api/admin/tag-groups", post(create_tag_group))
        .route(
            "/api/admin/tag-groups/{id}",
            put(update_tag_group).delete(delete_tag_group),
        )
        .route("/api/admin/tags", post(create_tag))
        .route("/api/admin/tags/{id}", put(rename_tag).delete(delete_tag))
        .route_layer(middleware::from_fn(require_contributor))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let admin = Router::new()
        .route("/api/admin/import-csv", post(import_csv_upload))
        .route("/api/admin/migrate", post(import_cms_export))
        .route("/api/admin/backfill-ingredients", post(backfill_ingredients))
        .route_layer(middleware::from_fn(require_admin))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    public
        .merge(signed_in)
        .merge(contributor)
        .merge(admin)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

// --- Server startup ---

pub async fn start_server(db: Database, port: u16, bind: &str, no_auth: bool) -> anyhow::Result<()> {
    let local_user = if no_auth {
        Some(db.ensure_local_admin()?)
    } else {
        if db.list_users()?.iter().all(|u| u.role != UserRole::Admin) {
            let token = crate::config::generate_token();
            let admin = db.insert_user("admin@localhost", UserRole::Admin, &hash_token(&token))?;
            eprintln!("Created admin user {} with API token: {token}", admin.email);
            eprintln!("Include in requests: Authorization: Bearer {token}");
        }
        None
    };

    if local_user.is_some() {
        tracing::warn!("Authentication disabled (--no-auth). Every request acts as a local admin.");
        if bind != "127.0.0.1" && bind != "localhost" {
            tracing::warn!(
                "Listening on {bind} with no authentication. Any device on your network can access this API."
            );
        }
    }

    let state = AppState {
        db: Arc::new(Mutex::new(db)),
        local_user,
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(format!("{bind}:{port}"))
        .await
        .with_context(|| format!("Failed to bind {bind}:{port}"))?;
    tracing::info!("Listening on http://{bind}:{port}");
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use potluck_core::models::NewRecipe;
    use tower::ServiceExt;

    const ADMIN_TOKEN: &str = "admin-token";
    const COOK_TOKEN: &str = "cook-token";
    const EDITOR_TOKEN: &str = "editor-token";

    fn test_state() -> AppState {
        let db = Database::open_in_memory().unwrap();
        db.insert_user("admin@example.com", UserRole::Admin, &hash_token(ADMIN_TOKEN))
            .unwrap();
        db.insert_user("cook@example.com", UserRole::Viewer, &hash_token(COOK_TOKEN))
            .unwrap();
        db.insert_user(
            "editor@example.com",
            UserRole::Contributor,
            &hash_token(EDITOR_TOKEN),
        )
        .unwrap();

        let (cuisine, _) = db
            .ensure_tag_group(&NewTagGroup {
                name: "Cuisine".into(),
                display_order: 0,
                kind: None,
            })
            .unwrap();
        let thai = db.insert_tag(cuisine.id, "Thai").unwrap();
        db.insert_recipe(&NewRecipe {
            slug: "pad-thai".into(),
            name: "Pad Thai".into(),
            ingredients_text: r#"{"type":"doc","content":[{"type":"paragraph","content":[{"type":"text","text":"Hello"}]}]}"#.into(),
            tag_ids: vec![thai.id],
            ..NewRecipe::default()
        })
        .unwrap();

        AppState {
            db: Arc::new(Mutex::new(db)),
            local_user: None,
        }
    }

    fn test_app() -> Router {
        build_router(test_state())
    }

    fn request(method: &str, uri: &str, token: Option<&str>, body: Option<&str>) -> axum::http::Request<Body> {
        let mut builder = axum::http::Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn public_recipe_list_needs_no_token() {
        let response = test_app()
            .oneshot(request("GET", "/api/recipes?search=pad", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json.as_array().unwrap().len(), 1);
        assert_eq!(json[0]["slug"], "pad-thai");
        assert_eq!(json[0]["tags"][0]["name"], "Thai");
    }

    #[tokio::test]
    async fn recipe_page_renders_html() {
        let response = test_app()
            .oneshot(request("GET", "/api/recipes/pad-thai", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["ingredients_html"], "<p>Hello</p>");
        assert_eq!(json["name"], "Pad Thai");
    }

    #[tokio::test]
    async fn unknown_recipe_is_404() {
        let response = test_app()
            .oneshot(request("GET", "/api/recipes/nope", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(body_json(response).await["error"].as_str().unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn auth_missing_token_returns_401() {
        let response = test_app()
            .oneshot(request("GET", "/api/me", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(response).await;
        assert_eq!(json["error"], "Invalid or missing API token");
    }

    #[tokio::test]
    async fn auth_wrong_token_returns_401() {
        let response = test_app()
            .oneshot(request("GET", "/api/me", Some("wrong"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn me_returns_token_owner() {
        let response = test_app()
            .oneshot(request("GET", "/api/me", Some(COOK_TOKEN), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["email"], "cook@example.com");
        assert_eq!(json["role"], "viewer");
    }

    #[tokio::test]
    async fn viewer_cannot_manage_recipes() {
        let response = test_app()
            .oneshot(request("GET", "/api/admin/recipes", Some(COOK_TOKEN), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn contributor_cannot_import() {
        let response = test_app()
            .oneshot(request(
                "POST",
                "/api/admin/backfill-ingredients",
                Some(EDITOR_TOKEN),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn no_auth_mode_acts_as_local_admin() {
        let mut state = test_state();
        let admin = state.db().ensure_local_admin().unwrap();
        state.local_user = Some(admin);
        let response = build_router(state)
            .oneshot(request("POST", "/api/admin/backfill-ingredients", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["processed"], 0);
    }

    #[tokio::test]
    async fn contributor_creates_and_updates_recipe() {
        let app = test_app();
        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/admin/recipes",
                Some(EDITOR_TOKEN),
                Some(r#"{"name":"Green Curry","instructions":"- Simmer\n- Serve"}"#),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let json = body_json(response).await;
        assert_eq!(json["slug"], "green-curry");
        assert_eq!(json["instructions_html"], "<ul><li>Simmer</li><li>Serve</li></ul>");
        let id = json["id"].as_i64().unwrap();

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/admin/recipes",
                Some(EDITOR_TOKEN),
                Some(r#"{"name":"Green Curry"}"#),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app
            .clone()
            .oneshot(request(
                "PUT",
                &format!("/api/admin/recipes/{id}"),
                Some(EDITOR_TOKEN),
                Some(r#"{"name":"Red Curry","slug":"red-curry"}"#),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["name"], "Red Curry");

        let response = app
            .oneshot(request(
                "DELETE",
                &format!("/api/admin/recipes/{id}"),
                Some(EDITOR_TOKEN),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn invalid_recipe_is_400() {
        let response = test_app()
            .oneshot(request(
                "POST",
                "/api/admin/recipes",
                Some(ADMIN_TOKEN),
                Some(r#"{"name":"  "}"#),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn tag_group_crud() {
        let app = test_app();
        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/admin/tag-groups",
                Some(EDITOR_TOKEN),
                Some(r#"{"name":"Protein","display_order":2,"kind":"ingredient"}"#),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let id = body_json(response).await["id"].as_i64().unwrap();

        let response = app
            .clone()
            .oneshot(request(
                "PUT",
                &format!("/api/admin/tag-groups/{id}"),
                Some(EDITOR_TOKEN),
                Some(r#"{"kind":null}"#),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_json(response).await["kind"].is_null());

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/admin/tags",
                Some(EDITOR_TOKEN),
                Some(&format!(r#"{{"tag_group_id":{id},"name":"Tofu"}}"#)),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .clone()
            .oneshot(request("GET", "/api/tag-groups", None, None))
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json[1]["name"], "Protein");
        assert_eq!(json[1]["tags"][0]["name"], "Tofu");

        let response = app
            .oneshot(request(
                "DELETE",
                "/api/admin/tag-groups/9999",
                Some(EDITOR_TOKEN),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn favorites_round_trip() {
        let app = test_app();
        let recipes = body_json(
            app.clone()
                .oneshot(request("GET", "/api/recipes", None, None))
                .await
                .unwrap(),
        )
        .await;
        let id = recipes[0]["id"].as_i64().unwrap();
        let uri = format!("/api/favorites/{id}");

        let response = app
            .clone()
            .oneshot(request("PUT", &uri, Some(COOK_TOKEN), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(
            app.clone()
                .oneshot(request("GET", &uri, Some(COOK_TOKEN), None))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(json["favorite"], true);

        let json = body_json(
            app.clone()
                .oneshot(request("GET", "/api/favorites", Some(COOK_TOKEN), None))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(json[0]["slug"], "pad-thai");

        // Other users keep their own favorites
        let json = body_json(
            app.clone()
                .oneshot(request("GET", "/api/favorites", Some(EDITOR_TOKEN), None))
                .await
                .unwrap(),
        )
        .await;
        assert!(json.as_array().unwrap().is_empty());

        let response = app
            .clone()
            .oneshot(request("PUT", "/api/favorites/9999", Some(COOK_TOKEN), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let json = body_json(
            app.oneshot(request("DELETE", &uri, Some(COOK_TOKEN), None))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(json["favorite"], false);
    }

    #[tokio::test]
    async fn calendar_schedule_and_next_slot() {
        let app = test_app();
        let recipes = body_json(
            app.clone()
                .oneshot(request("GET", "/api/recipes", None, None))
                .await
                .unwrap(),
        )
        .await;
        let id = recipes[0]["id"].as_i64().unwrap();

        let response = app
            .clone()
            .oneshot(request(
                "PUT",
                "/api/calendar/2024-03-05/breakfast",
                Some(COOK_TOKEN),
                Some(&format!(r#"{{"recipe_id":{id},"notes":"early"}}"#)),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let entry_id = body_json(response).await["id"].as_i64().unwrap();

        let json = body_json(
            app.clone()
                .oneshot(request(
                    "GET",
                    "/api/calendar/2024-03-05/next-slot",
                    Some(COOK_TOKEN),
                    None,
                ))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(json["meal_type"], "lunch");

        let json = body_json(
            app.clone()
                .oneshot(request(
                    "GET",
                    "/api/calendar?month=2024-03",
                    Some(COOK_TOKEN),
                    None,
                ))
                .await
                .unwrap(),
        )
        .await;
        let days = json["days"].as_array().unwrap();
        assert_eq!(days.len(), 35);
        let day = days.iter().find(|d| d["date"] == "2024-03-05").unwrap();
        assert_eq!(day["entries"][0]["recipe_slug"], "pad-thai");

        let response = app
            .clone()
            .oneshot(request(
                "PUT",
                "/api/calendar/2024-03-05/brunch",
                Some(COOK_TOKEN),
                Some(&format!(r#"{{"recipe_id":{id}}}"#)),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(request(
                "DELETE",
                &format!("/api/calendar/entries/{entry_id}"),
                Some(EDITOR_TOKEN),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(request(
                "DELETE",
                &format!("/api/calendar/entries/{entry_id}"),
                Some(COOK_TOKEN),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    fn multipart_body(boundary: &str, fields: &[(&str, &str)]) -> String {
        let mut body = String::new();
        for (name, content) in fields {
            body.push_str(&format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{name}.csv\"\r\nContent-Type: text/csv\r\n\r\n{content}\r\n"
            ));
        }
        body.push_str(&format!("--{boundary}--\r\n"));
        body
    }

    fn multipart_request(fields: &[(&str, &str)]) -> axum::http::Request<Body> {
        let boundary = "X-POTLUCK-BOUNDARY";
        axum::http::Request::post("/api/admin/import-csv")
            .header("Authorization", format!("Bearer {ADMIN_TOKEN}"))
            .header(
                "content-type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(multipart_body(boundary, fields)))
            .unwrap()
    }

    #[tokio::test]
    async fn csv_upload_imports_all_stages() {
        let app = test_app();
        let response = app
            .clone()
            .oneshot(multipart_request(&[
                ("tagGroups", "name,display_order\nProtein,1\n"),
                ("tags", "name,tag_group\nChicken,Protein\nTofu,Protein\n"),
                (
                    "recipes",
                    "name,tags,ingredients\nStir Fry,Thai,\"Chicken, Tofu\"\n",
                ),
            ]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["tagGroups"]["created"], 1);
        assert_eq!(json["tags"]["created"], 2);
        assert_eq!(json["recipes"]["created"], 1);

        let page = body_json(
            app.oneshot(request("GET", "/api/recipes/stir-fry", None, None))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(page["ingredient_tags"].as_array().unwrap().len(), 2);
        assert_eq!(page["tags"][0]["name"], "Thai");
    }

    #[tokio::test]
    async fn csv_upload_missing_field_is_400() {
        let response = test_app()
            .oneshot(multipart_request(&[("tagGroups", "name\nProtein\n")]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert!(json["error"].as_str().unwrap().starts_with("Missing CSV files"));
    }

    #[tokio::test]
    async fn csv_upload_bad_header_is_400() {
        let response = test_app()
            .oneshot(multipart_request(&[
                ("tagGroups", "title\nProtein\n"),
                ("tags", "name,tag_group\n"),
                ("recipes", "name\n"),
            ]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn cms_migrate_imports_export() {
        let body = r#"{
            "tagGroups": [{"id": "g1", "name": "Course"}],
            "tags": [{"id": "t1", "name": "Main", "tagGroup": "g1"}],
            "recipes": [{"name": "Khao Soi", "tags": ["t1"], "instructions": "<p>Boil</p>"}]
        }"#;
        let app = test_app();
        let response = app
            .clone()
            .oneshot(request("POST", "/api/admin/migrate", Some(ADMIN_TOKEN), Some(body)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["summary"]["recipes"]["created"], 1);

        let page = body_json(
            app.oneshot(request("GET", "/api/recipes/khao-soi", None, None))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(page["instructions_html"], "<p>Boil</p>");
    }

    #[tokio::test]
    async fn cms_migrate_missing_section_is_400_json() {
        let response = test_app()
            .oneshot(request(
                "POST",
                "/api/admin/migrate",
                Some(ADMIN_TOKEN),
                Some(r#"{"recipes":[],"tags":[]}"#),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("tagGroups"));
    }

    #[tokio::test]
    async fn malformed_json_body_is_400_json() {
        let response = test_app()
            .oneshot(request(
                "PUT",
                "/api/calendar/2024-03-05/lunch",
                Some(COOK_TOKEN),
                Some("{not json"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert!(json["error"].is_string());
    }

    #[tokio::test]
    async fn security_headers_present() {
        let response = test_app()
            .oneshot(request("GET", "/api/tag-groups", None, None))
            .await
            .unwrap();
        assert_eq!(
            response.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
        assert_eq!(response.headers().get("x-frame-options").unwrap(), "DENY");
        assert_eq!(
            response.headers().get("content-security-policy").unwrap(),
            "default-src 'none'"
        );
    }

    #[tokio::test]
    async fn security_headers_on_auth_failure() {
        let response = test_app()
            .oneshot(request("GET", "/api/favorites", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
    }

    #[tokio::test]
    async fn body_size_limit_rejects_oversized() {
        let big_body = vec![0u8; BODY_LIMIT + 1];
        let response = test_app()
            .oneshot(
                axum::http::Request::post("/api/admin/migrate")
                    .header("Authorization", format!("Bearer {ADMIN_TOKEN}"))
                    .header("content-type", "application/json")
                    .body(Body::from(big_body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn internal_error_does_not_leak_details() {
        let error = ApiError::Internal(anyhow::anyhow!("secret database path /home/user/potluck.db"));
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let json = body_json(response).await;
        assert_eq!(json["error"], "Internal server error");
        assert!(!json["error"].as_str().unwrap().contains("secret"));
    }

    #[test]
    fn store_errors_map_to_status() {
        let err: ApiError = anyhow::Error::new(StoreError::Conflict("taken".into())).into();
        assert!(matches!(err, ApiError::Conflict(_)));
        let err: ApiError = anyhow::Error::new(StoreError::Invalid("bad".into()))
            .context("while saving")
            .into();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }
}
