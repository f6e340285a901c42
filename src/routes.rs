use actix_files::{Files, NamedFile};
use actix_identity::IdentityExt;
use actix_session::Session;
use actix_web::{
    get,
    http::{Method, StatusCode},
    post,
    web::{self, Data},
    Either, HttpRequest, HttpResponse, Responder,
};
use serde::{Deserialize, Serialize};
use tera::Context;

use crate::{
    auth::{self, home_route, redirect, AuthContext, RequireUser, LANDLORD_HOME, LOGIN_ROUTE},
    backend::{BackendError, SignUp},
    db,
    errors::AppError,
    notice::{self, messages, Notice},
    structs::{NewProperty, Payment, Property, Role, UserMetadata},
    utils::parse_num_units,
    AppState, TEMPLATES,
};

fn page_context(title: &str, session: &Session) -> Context {
    let mut context = Context::new();
    context.insert("title", title);
    context.insert("version", env!("CARGO_PKG_VERSION"));
    context.insert("notice", &notice::take(session));
    context
}

fn render(template: &str, context: &Context, status: StatusCode) -> Result<HttpResponse, AppError> {
    let rendered = TEMPLATES.render(template, context).map_err(|e| {
        log::error!("Failed to render template: {}", e);
        AppError::TemplateError(e)
    })?;

    Ok(HttpResponse::build(status)
        .content_type("text/html; charset=utf-8")
        .body(rendered))
}

/// Service rejections keep the user on the form with 422; anything else is
/// unexpected.
fn failure_status(err: &BackendError) -> StatusCode {
    if err.user_message().is_some() {
        StatusCode::UNPROCESSABLE_ENTITY
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

#[get("/")]
pub async fn index_handler(auth: AuthContext, session: Session) -> Result<impl Responder, AppError> {
    let mut context = page_context("Vivo", &session);
    context.insert("home", &auth.home());
    context.insert("display_name", &auth.user().map(|u| u.display_name()));
    render("index.html", &context, StatusCode::OK)
}

#[derive(Deserialize)]
pub struct Login {
    #[serde(default)]
    email: String,
    #[serde(default)]
    password: String,
}

#[get("/login")]
pub async fn login_handler(auth: AuthContext, session: Session) -> Result<impl Responder, AppError> {
    // Already signed in: straight to the dashboard.
    if let Some(home) = auth.home() {
        return Ok(redirect(home));
    }
    let mut context = page_context("התחברות", &session);
    context.insert("email", "");
    render("login.html", &context, StatusCode::OK)
}

#[post("/login")]
pub async fn login_form_handler(
    web::Form(form): web::Form<Login>,
    state: Data<AppState>,
    request: HttpRequest,
    session: Session,
) -> Result<impl Responder, AppError> {
    let mut context = page_context("התחברות", &session);
    context.insert("email", &form.email);

    if form.email.trim().is_empty() || form.password.is_empty() {
        context.insert(
            "notice",
            &Notice::error(messages::ERROR, messages::FIELDS_REQUIRED),
        );
        return render("login.html", &context, StatusCode::BAD_REQUEST);
    }

    log::info!("Attempting to sign in with: {}", form.email);
    match state.backend.sign_in(&form.email, &form.password).await {
        Ok(auth) => {
            let home = home_route(auth.user.role());
            log::info!("User {} signed in with role {:?}", auth.user.id, auth.user.role());
            auth::establish(&request, &session, auth)?;
            notice::flash(
                &session,
                Notice::success(messages::LOGIN_OK, messages::LOGIN_REDIRECT),
            )?;
            Ok(redirect(home))
        }
        Err(e) => {
            let status = match e {
                BackendError::Auth { .. } => StatusCode::UNAUTHORIZED,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            context.insert(
                "notice",
                &Notice::error(messages::LOGIN_FAILED, notice::login_message(&e)),
            );
            render("login.html", &context, status)
        }
    }
}

#[derive(Deserialize)]
pub struct RoleQuery {
    role: Option<String>,
}

#[derive(Deserialize)]
pub struct Register {
    #[serde(default)]
    full_name: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    password: String,
    role: Option<String>,
}

fn register_context(session: &Session, role: Option<Role>, full_name: &str, email: &str) -> Context {
    let mut context = page_context("הרשמה", session);
    context.insert("role", &role.map(|r| r.as_str()));
    context.insert("full_name", full_name);
    context.insert("email", email);
    context
}

/// Without a role the page asks for one first; with a role it shows the form.
#[get("/register")]
pub async fn register_handler(
    web::Query(query): web::Query<RoleQuery>,
    session: Session,
) -> Result<impl Responder, AppError> {
    let role = query.role.as_deref().and_then(Role::parse);
    let context = register_context(&session, role, "", "");
    render("register.html", &context, StatusCode::OK)
}

#[post("/register")]
pub async fn register_form_handler(
    web::Form(form): web::Form<Register>,
    state: Data<AppState>,
    session: Session,
) -> Result<impl Responder, AppError> {
    let Some(role) = form.role.as_deref().and_then(Role::parse) else {
        let mut context = register_context(&session, None, &form.full_name, &form.email);
        context.insert("notice", &Notice::error(messages::ERROR, messages::SELECT_ROLE));
        return render("register.html", &context, StatusCode::BAD_REQUEST);
    };

    let mut context = register_context(&session, Some(role), &form.full_name, &form.email);
    if form.full_name.trim().is_empty() || form.email.trim().is_empty() || form.password.is_empty()
    {
        context.insert(
            "notice",
            &Notice::error(messages::ERROR, messages::FIELDS_REQUIRED),
        );
        return render("register.html", &context, StatusCode::BAD_REQUEST);
    }

    log::info!(
        "Attempting to register user with: {} ({})",
        form.email,
        role.as_str()
    );
    let request = SignUp {
        email: form.email.trim().to_string(),
        password: form.password,
        metadata: UserMetadata {
            role: Some(role.as_str().to_string()),
            full_name: Some(form.full_name.trim().to_string()),
        },
        redirect_to: state.config.confirm_url(),
    };

    match state.backend.sign_up(request).await {
        Ok(outcome) => {
            let detail = if outcome.confirmation_required {
                messages::REGISTER_CONFIRM_EMAIL
            } else {
                messages::REGISTER_READY
            };
            // Cleared form, role choice included.
            let mut context = register_context(&session, None, "", "");
            context.insert("notice", &Notice::success(messages::REGISTER_OK, detail));
            render("register.html", &context, StatusCode::OK)
        }
        Err(e) => {
            context.insert(
                "notice",
                &Notice::error(messages::REGISTER_FAILED, notice::service_message(&e)),
            );
            render("register.html", &context, failure_status(&e))
        }
    }
}

#[post("/logout")]
pub async fn logout_handler(
    auth: AuthContext,
    state: Data<AppState>,
    request: HttpRequest,
    session: Session,
) -> Result<impl Responder, AppError> {
    let Some(current) = auth.session() else {
        return Ok(redirect("/"));
    };

    match state.backend.sign_out(current).await {
        Ok(()) => {
            log::info!("User {} signed out", current.user.id);
            auth::clear(request.get_identity().ok(), &session);
            notice::flash(
                &session,
                Notice::success(messages::SIGN_OUT_OK, messages::SIGN_OUT_OK_DETAIL),
            )?;
            Ok(redirect("/"))
        }
        Err(_) => {
            notice::flash(
                &session,
                Notice::error(messages::ERROR, messages::SIGN_OUT_FAILED),
            )?;
            Ok(redirect(home_route(current.user.role())))
        }
    }
}

#[derive(Serialize)]
struct PropertyView {
    address: String,
    city: String,
    num_units: i64,
    created_on: Option<String>,
}

impl From<Property> for PropertyView {
    fn from(property: Property) -> Self {
        PropertyView {
            created_on: property.created_on(),
            address: property.address,
            city: property.city,
            num_units: property.num_units.unwrap_or(1),
        }
    }
}

/// Landlord figures. `None` marks data this app does not collect yet.
#[derive(Serialize)]
struct LandlordMetrics {
    properties: usize,
    tenants: Option<u64>,
    monthly_income: Option<f64>,
    pending_payments: Option<u64>,
}

#[get("/dashboard-landlord")]
pub async fn landlord_dashboard_handler(
    user: RequireUser,
    state: Data<AppState>,
    session: Session,
) -> Result<impl Responder, AppError> {
    let properties = match db::get_properties_for_landlord(state.backend.store(), &user.0).await {
        Ok(properties) => properties,
        Err(e) => {
            log::error!("Error fetching properties: {}", e);
            Vec::new()
        }
    };
    let properties: Vec<PropertyView> = properties.into_iter().map(PropertyView::from).collect();
    let metrics = LandlordMetrics {
        properties: properties.len(),
        tenants: None,
        monthly_income: None,
        pending_payments: None,
    };

    let mut context = page_context("דשבורד בעל דירה", &session);
    context.insert("display_name", &user.user().display_name());
    context.insert("metrics", &metrics);
    context.insert("properties", &properties);
    render("dashboard_landlord.html", &context, StatusCode::OK)
}

/// Tenant data. Bills, payments and leases are not wired to the store yet,
/// so every field is empty.
#[derive(Serialize, Default)]
struct TenantOverview {
    next_payment: Option<Payment>,
    account_status: Option<String>,
    receipts: Option<u64>,
    recent_payments: Vec<Payment>,
    property: Option<Property>,
}

#[get("/dashboard-tenant")]
pub async fn tenant_dashboard_handler(
    user: RequireUser,
    session: Session,
) -> Result<impl Responder, AppError> {
    let mut context = page_context("דשבורד שוכר", &session);
    context.insert("display_name", &user.user().display_name());
    context.insert("overview", &TenantOverview::default());
    render("dashboard_tenant.html", &context, StatusCode::OK)
}

#[derive(Deserialize)]
pub struct PropertyForm {
    #[serde(default)]
    address: String,
    #[serde(default)]
    city: String,
    #[serde(default, rename = "numUnits")]
    num_units: String,
    #[serde(default)]
    description: String,
}

fn property_context(session: &Session, form: Option<&PropertyForm>) -> Context {
    let mut context = page_context("הוסף נכס חדש", session);
    context.insert("address", form.map_or("", |f| f.address.as_str()));
    context.insert("city", form.map_or("", |f| f.city.as_str()));
    context.insert(
        "num_units",
        &form.map_or(1, |f| parse_num_units(&f.num_units)),
    );
    context.insert("description", form.map_or("", |f| f.description.as_str()));
    context
}

#[get("/landlord/add-property")]
pub async fn add_property_handler(
    _user: RequireUser,
    session: Session,
) -> Result<impl Responder, AppError> {
    let context = property_context(&session, None);
    render("add_property.html", &context, StatusCode::OK)
}

#[post("/landlord/add-property")]
pub async fn add_property_form_handler(
    user: RequireUser,
    web::Form(form): web::Form<PropertyForm>,
    state: Data<AppState>,
    session: Session,
) -> Result<impl Responder, AppError> {
    let mut context = property_context(&session, Some(&form));

    if form.address.trim().is_empty() || form.city.trim().is_empty() {
        context.insert(
            "notice",
            &Notice::error(messages::ERROR, messages::PROPERTY_REQUIRED),
        );
        return render("add_property.html", &context, StatusCode::BAD_REQUEST);
    }

    let property = NewProperty {
        landlord_id: user.user().id.clone(),
        address: form.address.trim().to_string(),
        city: form.city.trim().to_string(),
        num_units: parse_num_units(&form.num_units),
    };
    log::info!("Adding property: {:?}", property);

    match db::create_property(state.backend.store(), &user.0, &property).await {
        Ok(()) => {
            notice::flash(
                &session,
                Notice::success(messages::PROPERTY_OK, messages::PROPERTY_OK_DETAIL),
            )?;
            // Full navigation so the dashboard reloads its data.
            Ok(redirect(LANDLORD_HOME))
        }
        Err(e) => {
            context.insert(
                "notice",
                &Notice::error(messages::ERROR, messages::PROPERTY_FAILED),
            );
            render("add_property.html", &context, failure_status(&e))
        }
    }
}

#[derive(Deserialize)]
pub struct ConfirmQuery {
    token_hash: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

/// Landing point of the signup confirmation link.
#[get("/auth/confirm")]
pub async fn confirm_handler(
    web::Query(query): web::Query<ConfirmQuery>,
    state: Data<AppState>,
    request: HttpRequest,
    session: Session,
) -> Result<impl Responder, AppError> {
    let token_hash = match (query.token_hash, query.kind.as_deref()) {
        (Some(token_hash), Some("signup") | Some("email")) if !token_hash.is_empty() => token_hash,
        _ => {
            notice::flash(
                &session,
                Notice::error(messages::CONFIRM_FAILED, "Email link is invalid or has expired"),
            )?;
            return Ok(redirect(LOGIN_ROUTE));
        }
    };

    match state.backend.verify_signup(&token_hash).await {
        Ok(auth) => {
            log::info!("User {} confirmed their email", auth.user.id);
            auth::establish(&request, &session, auth)?;
            notice::flash(
                &session,
                Notice::success(messages::CONFIRM_OK, messages::CONFIRM_OK_DETAIL),
            )?;
            Ok(redirect("/"))
        }
        Err(e) => {
            notice::flash(
                &session,
                Notice::error(messages::CONFIRM_FAILED, notice::service_message(&e)),
            )?;
            Ok(redirect(LOGIN_ROUTE))
        }
    }
}

/// favicon handler
#[get("/favicon")]
pub async fn favicon_handler() -> Result<impl Responder, AppError> {
    Ok(NamedFile::open("static/favicon.svg")?)
}

pub async fn default_handler(req_method: Method) -> Result<impl Responder, std::io::Error> {
    match req_method {
        Method::GET => {
            let file = NamedFile::open("static/404.html")?
                .customize()
                .with_status(StatusCode::NOT_FOUND);
            Ok(Either::Left(file))
        }
        _ => Ok(Either::Right(HttpResponse::MethodNotAllowed().finish())),
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(Files::new("/static", "static"))
        .service(favicon_handler)
        .service(index_handler)
        .service(login_handler)
        .service(login_form_handler)
        .service(register_handler)
        .service(register_form_handler)
        .service(logout_handler)
        .service(landlord_dashboard_handler)
        .service(tenant_dashboard_handler)
        .service(add_property_handler)
        .service(add_property_form_handler)
        .service(confirm_handler);
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use actix_web::{
        body::MessageBody,
        cookie::{Cookie, Key},
        dev::ServiceResponse,
        http::header,
        test, App,
    };

    use async_trait::async_trait;

    use super::*;
    use crate::{
        backend::{local::LocalBackend, AuthService, Backend, SignUpOutcome},
        config::{AppConfig, BackendConfig},
        identity_middleware, session_middleware,
        structs::AuthSession,
    };

    const PASSWORD: &str = "secret-password";

    async fn local(autoconfirm: bool, session_ttl_secs: i64) -> (AppConfig, Arc<LocalBackend>) {
        let config = AppConfig::from_lookup(|key| match key {
            "SESSION_KEY" => Some("k".repeat(64)),
            "BACKEND" => Some("local".to_string()),
            "DATABASE_URL" => Some("sqlite::memory:".to_string()),
            "LOCAL_AUTOCONFIRM" => Some(autoconfirm.to_string()),
            "SESSION_TTL_SECS" => Some(session_ttl_secs.to_string()),
            "SITE_URL" => Some("http://localhost:8080".to_string()),
            _ => None,
        })
        .unwrap();
        let BackendConfig::Local(local_config) = &config.backend else {
            panic!("expected a local backend");
        };
        let local = Arc::new(LocalBackend::connect(local_config).await.unwrap());
        (config, local)
    }

    async fn state(autoconfirm: bool) -> (Data<AppState>, Arc<LocalBackend>) {
        let (config, local) = local(autoconfirm, 3600).await;
        let state = Data::new(AppState {
            backend: Backend::new(local.clone(), local.clone()),
            config: Arc::new(config),
        });
        (state, local)
    }

    /// Auth service whose sign-up and sign-out never reach the server.
    /// Sign-in is delegated unless `sign_in_down` is set.
    struct Outage {
        inner: Arc<LocalBackend>,
        sign_in_down: bool,
    }

    fn connection_refused() -> BackendError {
        BackendError::Transport("error sending request: connection refused".into())
    }

    #[async_trait]
    impl AuthService for Outage {
        async fn sign_up(&self, _request: SignUp) -> Result<SignUpOutcome, BackendError> {
            Err(connection_refused())
        }

        async fn sign_in_with_password(
            &self,
            email: &str,
            password: &str,
        ) -> Result<AuthSession, BackendError> {
            if self.sign_in_down {
                return Err(connection_refused());
            }
            self.inner.sign_in_with_password(email, password).await
        }

        async fn sign_out(&self, _access_token: &str) -> Result<(), BackendError> {
            Err(connection_refused())
        }

        async fn refresh_session(&self, refresh_token: &str) -> Result<AuthSession, BackendError> {
            self.inner.refresh_session(refresh_token).await
        }

        async fn verify_signup(&self, token_hash: &str) -> Result<AuthSession, BackendError> {
            self.inner.verify_signup(token_hash).await
        }
    }

    async fn outage_state(sign_in_down: bool) -> (Data<AppState>, Arc<LocalBackend>) {
        let (config, local) = local(true, 3600).await;
        let auth = Arc::new(Outage {
            inner: local.clone(),
            sign_in_down,
        });
        let state = Data::new(AppState {
            backend: Backend::new(auth, local.clone()),
            config: Arc::new(config),
        });
        (state, local)
    }

    macro_rules! app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .wrap(identity_middleware())
                    .wrap(session_middleware(Key::generate(), false))
                    .app_data($state.clone())
                    .configure(configure)
                    .default_service(web::to(default_handler)),
            )
            .await
        };
    }

    fn location<B>(resp: &ServiceResponse<B>) -> &str {
        resp.headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
    }

    /// The session cookie set by `resp`, or `current` when it set none.
    fn cookie_after<B>(
        resp: &ServiceResponse<B>,
        current: Option<Cookie<'static>>,
    ) -> Option<Cookie<'static>> {
        resp.response()
            .cookies()
            .find(|c| c.name() == "id")
            .map(|c| c.into_owned())
            .or(current)
    }

    async fn body_text<B: MessageBody>(resp: ServiceResponse<B>) -> String {
        String::from_utf8(test::read_body(resp).await.to_vec()).unwrap()
    }

    fn register_request(email: &str, role: Option<&str>) -> test::TestRequest {
        let mut form = vec![
            ("full_name", "Dana Levi"),
            ("email", email),
            ("password", PASSWORD),
        ];
        if let Some(role) = role {
            form.push(("role", role));
        }
        test::TestRequest::post().uri("/register").set_form(form)
    }

    fn login_request(email: &str, password: &str) -> test::TestRequest {
        test::TestRequest::post()
            .uri("/login")
            .set_form([("email", email), ("password", password)])
    }

    async fn count(local: &LocalBackend, sql: &str) -> i64 {
        sqlx::query_scalar::<_, i64>(sql)
            .fetch_one(local.pool())
            .await
            .unwrap()
    }

    #[actix_web::test]
    async fn register_without_role_never_reaches_the_backend() {
        let (state, local) = state(true).await;
        let app = app!(state);

        let resp = test::call_service(&app, register_request("dana@example.com", None).to_request()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(resp).await.contains(messages::SELECT_ROLE));
        assert_eq!(count(&local, "SELECT COUNT(*) FROM auth_users").await, 0);
    }

    #[actix_web::test]
    async fn register_creates_account_with_role() {
        let (state, local) = state(false).await;
        let app = app!(state);

        let resp = test::call_service(
            &app,
            register_request("dana@example.com", Some("landlord")).to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_text(resp).await;
        assert!(body.contains(messages::REGISTER_OK));
        assert!(body.contains(messages::REGISTER_CONFIRM_EMAIL));
        assert_eq!(count(&local, "SELECT COUNT(*) FROM landlords").await, 1);

        let resp = test::call_service(
            &app,
            register_request("dana@example.com", Some("landlord")).to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body_text(resp).await.contains("User already registered"));
    }

    #[actix_web::test]
    async fn register_page_asks_for_a_role_first() {
        let (state, _) = state(true).await;
        let app = app!(state);

        let resp = test::call_service(&app, test::TestRequest::get().uri("/register").to_request()).await;
        let body = body_text(resp).await;
        assert!(body.contains("בחר את התפקיד שלך"));
        assert!(!body.contains("name=\"password\""));

        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri("/register?role=tenant").to_request(),
        )
        .await;
        let body = body_text(resp).await;
        assert!(body.contains("name=\"password\""));
        assert!(body.contains("value=\"tenant\""));
    }

    #[actix_web::test]
    async fn wrong_password_shows_localized_message() {
        let (state, _) = state(true).await;
        let app = app!(state);
        test::call_service(&app, register_request("dana@example.com", Some("tenant")).to_request()).await;

        let resp = test::call_service(&app, login_request("dana@example.com", "nope-nope").to_request()).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let body = body_text(resp).await;
        assert!(body.contains(messages::INVALID_CREDENTIALS));
        assert!(body.contains("dana@example.com"));
    }

    #[actix_web::test]
    async fn login_redirects_by_role() {
        let (state, _) = state(true).await;
        let app = app!(state);
        test::call_service(&app, register_request("owner@example.com", Some("landlord")).to_request()).await;
        test::call_service(&app, register_request("renter@example.com", Some("tenant")).to_request()).await;
        state
            .backend
            .sign_up(SignUp {
                email: "nobody@example.com".to_string(),
                password: PASSWORD.to_string(),
                metadata: UserMetadata::default(),
                redirect_to: state.config.confirm_url(),
            })
            .await
            .unwrap();

        for (email, home) in [
            ("owner@example.com", "/dashboard-landlord"),
            ("renter@example.com", "/dashboard-tenant"),
            ("nobody@example.com", "/dashboard-tenant"),
        ] {
            let resp = test::call_service(&app, login_request(email, PASSWORD).to_request()).await;
            assert_eq!(resp.status(), StatusCode::SEE_OTHER, "{}", email);
            assert_eq!(location(&resp), home, "{}", email);
        }
    }

    #[actix_web::test]
    async fn login_page_sends_signed_in_users_home() {
        let (state, _) = state(true).await;
        let app = app!(state);
        test::call_service(&app, register_request("owner@example.com", Some("landlord")).to_request()).await;
        let resp = test::call_service(&app, login_request("owner@example.com", PASSWORD).to_request()).await;
        let cookie = cookie_after(&resp, None).unwrap();

        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri(LOGIN_ROUTE).cookie(cookie).to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&resp), LANDLORD_HOME);
    }

    #[actix_web::test]
    async fn protected_pages_redirect_to_login() {
        let (state, _) = state(true).await;
        let app = app!(state);

        for uri in ["/dashboard-landlord", "/dashboard-tenant", "/landlord/add-property"] {
            let resp = test::call_service(&app, test::TestRequest::get().uri(uri).to_request()).await;
            assert_eq!(resp.status(), StatusCode::SEE_OTHER, "{}", uri);
            assert_eq!(location(&resp), LOGIN_ROUTE, "{}", uri);
        }
    }

    #[actix_web::test]
    async fn landlord_adds_a_property() {
        let (state, local) = state(true).await;
        let app = app!(state);
        test::call_service(&app, register_request("owner@example.com", Some("landlord")).to_request()).await;
        let resp = test::call_service(&app, login_request("owner@example.com", PASSWORD).to_request()).await;
        let cookie = cookie_after(&resp, None).unwrap();

        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/landlord/add-property")
                .cookie(cookie.clone())
                .set_form([("address", "Herzl 15"), ("city", "Tel Aviv"), ("numUnits", "3")])
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&resp), LANDLORD_HOME);
        let cookie = cookie_after(&resp, Some(cookie)).unwrap();

        assert_eq!(
            count(&local, "SELECT COUNT(*) FROM properties WHERE address = 'Herzl 15' AND num_units = 3").await,
            1
        );

        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri(LANDLORD_HOME).cookie(cookie).to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_text(resp).await;
        assert!(body.contains("Herzl 15"));
        assert!(body.contains(messages::PROPERTY_OK));
        assert!(body.contains("Dana Levi"));
    }

    #[actix_web::test]
    async fn non_numeric_units_default_to_one() {
        let (state, local) = state(true).await;
        let app = app!(state);
        test::call_service(&app, register_request("owner@example.com", Some("landlord")).to_request()).await;
        let resp = test::call_service(&app, login_request("owner@example.com", PASSWORD).to_request()).await;
        let cookie = cookie_after(&resp, None).unwrap();

        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/landlord/add-property")
                .cookie(cookie)
                .set_form([("address", "Herzl 15"), ("city", "Tel Aviv"), ("numUnits", "abc")])
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert_eq!(count(&local, "SELECT num_units FROM properties").await, 1);
    }

    #[actix_web::test]
    async fn property_without_city_is_rejected() {
        let (state, local) = state(true).await;
        let app = app!(state);
        test::call_service(&app, register_request("owner@example.com", Some("landlord")).to_request()).await;
        let resp = test::call_service(&app, login_request("owner@example.com", PASSWORD).to_request()).await;
        let cookie = cookie_after(&resp, None).unwrap();

        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/landlord/add-property")
                .cookie(cookie)
                .set_form([("address", "Herzl 15"), ("city", "  "), ("numUnits", "2")])
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_text(resp).await;
        assert!(body.contains(messages::PROPERTY_REQUIRED));
        assert!(body.contains("Herzl 15"));
        assert_eq!(count(&local, "SELECT COUNT(*) FROM properties").await, 0);
    }

    #[actix_web::test]
    async fn logout_ends_the_session() {
        let (state, local) = state(true).await;
        let app = app!(state);
        test::call_service(&app, register_request("renter@example.com", Some("tenant")).to_request()).await;
        let resp = test::call_service(&app, login_request("renter@example.com", PASSWORD).to_request()).await;
        let cookie = cookie_after(&resp, None).unwrap();

        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri("/dashboard-tenant").cookie(cookie.clone()).to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let cookie = cookie_after(&resp, Some(cookie)).unwrap();

        let resp = test::call_service(
            &app,
            test::TestRequest::post().uri("/logout").cookie(cookie.clone()).to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&resp), "/");
        let cookie = cookie_after(&resp, Some(cookie)).unwrap();
        assert_eq!(count(&local, "SELECT COUNT(*) FROM auth_sessions").await, 0);

        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri("/").cookie(cookie.clone()).to_request(),
        )
        .await;
        let cookie_next = cookie_after(&resp, Some(cookie));
        assert!(body_text(resp).await.contains(messages::SIGN_OUT_OK));

        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/dashboard-tenant")
                .cookie(cookie_next.unwrap())
                .to_request(),
        )
        .await;
        assert_eq!(location(&resp), LOGIN_ROUTE);
    }

    #[actix_web::test]
    async fn confirmation_link_signs_the_user_in() {
        let (state, local) = state(false).await;
        let app = app!(state);
        test::call_service(&app, register_request("renter@example.com", Some("tenant")).to_request()).await;

        let resp = test::call_service(&app, login_request("renter@example.com", PASSWORD).to_request()).await;
        assert!(body_text(resp).await.contains("Email not confirmed"));

        let token: String = sqlx::query_scalar("SELECT confirmation_token FROM auth_users")
            .fetch_one(local.pool())
            .await
            .unwrap();
        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri(&format!("/auth/confirm?token_hash={}&type=signup", token))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&resp), "/");
        let cookie = cookie_after(&resp, None).unwrap();

        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri("/dashboard-tenant").cookie(cookie).to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn bad_confirmation_link_goes_to_login() {
        let (state, _) = state(false).await;
        let app = app!(state);

        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/auth/confirm?token_hash=bogus&type=signup")
                .to_request(),
        )
        .await;
        assert_eq!(location(&resp), LOGIN_ROUTE);

        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri("/auth/confirm?type=recovery").to_request(),
        )
        .await;
        assert_eq!(location(&resp), LOGIN_ROUTE);
    }

    #[actix_web::test]
    async fn unknown_routes_are_not_found() {
        let (state, _) = state(true).await;
        let app = app!(state);

        let resp = test::call_service(&app, test::TestRequest::get().uri("/nope").to_request()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = test::call_service(&app, test::TestRequest::delete().uri("/nope").to_request()).await;
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[actix_web::test]
    async fn two_tabs_refreshing_one_cookie_stay_signed_in() {
        let (config, local) = local(true, 0).await;
        let state = Data::new(AppState {
            backend: Backend::new(local.clone(), local.clone()),
            config: Arc::new(config),
        });
        let app = app!(state);
        test::call_service(&app, register_request("renter@example.com", Some("tenant")).to_request()).await;
        let resp = test::call_service(&app, login_request("renter@example.com", PASSWORD).to_request()).await;
        let cookie = cookie_after(&resp, None).unwrap();

        // Both requests carry the same expired access token and the same
        // single-use refresh token.
        let first = test::call_service(
            &app,
            test::TestRequest::get().uri("/dashboard-tenant").cookie(cookie.clone()).to_request(),
        )
        .await;
        let second = test::call_service(
            &app,
            test::TestRequest::get().uri("/dashboard-tenant").cookie(cookie.clone()).to_request(),
        )
        .await;
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::OK);

        // Whichever response the browser keeps, the user is still signed in.
        for resp in [first, second] {
            let cookie = cookie_after(&resp, Some(cookie.clone())).unwrap();
            let resp = test::call_service(
                &app,
                test::TestRequest::get().uri("/dashboard-tenant").cookie(cookie).to_request(),
            )
            .await;
            assert_eq!(resp.status(), StatusCode::OK);
        }
    }

    #[actix_web::test]
    async fn unreachable_auth_service_shows_generic_notice() {
        let (state, local) = outage_state(true).await;
        let app = app!(state);

        let resp = test::call_service(
            &app,
            register_request("dana@example.com", Some("tenant")).to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_text(resp).await;
        assert!(body.contains(messages::UNEXPECTED_ERROR));
        assert!(!body.contains("connection refused"));
        assert_eq!(count(&local, "SELECT COUNT(*) FROM auth_users").await, 0);

        let resp = test::call_service(&app, login_request("dana@example.com", PASSWORD).to_request()).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_text(resp).await;
        assert!(body.contains(messages::UNEXPECTED_ERROR));
        assert!(body.contains("dana@example.com"));
    }

    #[actix_web::test]
    async fn failed_sign_out_keeps_the_user_signed_in() {
        let (state, local) = outage_state(false).await;
        let app = app!(state);
        local
            .sign_up(SignUp {
                email: "owner@example.com".to_string(),
                password: PASSWORD.to_string(),
                metadata: UserMetadata {
                    role: Some("landlord".to_string()),
                    full_name: Some("Owner".to_string()),
                },
                redirect_to: state.config.confirm_url(),
            })
            .await
            .unwrap();
        let resp = test::call_service(&app, login_request("owner@example.com", PASSWORD).to_request()).await;
        let cookie = cookie_after(&resp, None).unwrap();

        let resp = test::call_service(
            &app,
            test::TestRequest::post().uri("/logout").cookie(cookie.clone()).to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&resp), LANDLORD_HOME);
        let cookie = cookie_after(&resp, Some(cookie)).unwrap();

        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri(LANDLORD_HOME).cookie(cookie).to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_text(resp).await.contains(messages::SIGN_OUT_FAILED));
        assert_eq!(count(&local, "SELECT COUNT(*) FROM auth_sessions").await, 1);
    }
}
