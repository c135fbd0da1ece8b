use axum_extra::extract::cookie::{Cookie, SameSite};
use time::Duration;

pub const SESSION_COOKIE: &str = "token";

const SESSION_TTL: Duration = Duration::days(7);

fn base(value: String, production: bool) -> Cookie<'static> {
    let mut cookie = Cookie::new(SESSION_COOKIE, value);
    cookie.set_path("/");
    cookie.set_http_only(true);
    cookie.set_secure(production);
    cookie.set_same_site(if production {
        // Cross-site frontend in production.
        SameSite::None
    } else {
        SameSite::Strict
    });
    cookie
}

pub fn session_cookie(token: String, production: bool) -> Cookie<'static> {
    let mut cookie = base(token, production);
    cookie.set_max_age(SESSION_TTL);
    cookie
}

/// Attributes must match `session_cookie` exactly; some clients keep a
/// cookie whose removal was requested with different attributes.
pub fn clear_session_cookie(production: bool) -> Cookie<'static> {
    let mut cookie = base(String::new(), production);
    cookie.set_max_age(Duration::ZERO);
    cookie
}
