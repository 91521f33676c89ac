use diesel::r2d2::{ConnectionManager, Pool};
use diesel::PgConnection;

pub type DbPool = Pool<ConnectionManager<PgConnection>>;

pub fn create_conn(database_url: &str, max_connections: u32) -> anyhow::Result<DbPool> {
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    Ok(Pool::builder().max_size(max_connections).build(manager)?)
}

/// Rough token estimate used for the provider prompt-cache threshold.
pub fn estimate_token_count(text: &str) -> usize {
    let char_count = text.chars().count();
    char_count.div_ceil(4).max(1)
}

/// Truncate on a char boundary, appending an ellipsis when cut.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max).collect();
    format!("{}...", cut)
}

/// CURP: 18 alphanumeric characters.
pub fn is_valid_curp(curp: &str) -> bool {
    curp.len() == 18 && curp.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Phone: 10 to 15 digits, optional leading +.
pub fn is_valid_phone(phone: &str) -> bool {
    let digits = phone.strip_prefix('+').unwrap_or(phone);
    (10..=15).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit())
}

/// Minimal local@domain.tld shape check.
pub fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.is_empty() || email.contains(' ') {
        return false;
    }
    match domain.rsplit_once('.') {
        Some((host, tld)) => !host.is_empty() && tld.len() >= 2,
        None => false,
    }
}
