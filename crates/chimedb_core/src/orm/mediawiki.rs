//! Logins checked against the CHIME wiki's user table.
//!
//! The wiki's `user` table is exposed to the data database as a view named
//! `mediawikiuser`. Only `user_id`, `user_name` and `user_password` are read.
//! The sole hash format understood is MediaWiki's salted MD5 ("B") type:
//!
//! ```text
//! :B:<salt>:<md5(salt + "-" + md5(password))>
//! ```

use crate::error::{ChimeDbError, ChimeDbResult};
use crate::models::Value;
use crate::proxy::PROXY;

/// Name of the view over the wiki's user table.
pub const TABLE: &str = "mediawikiuser";

const WRONG_CREDENTIALS: &str = "Wrong username or password.";

/// A wiki user whose password has been checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaWikiUser {
    /// Wiki user id
    pub user_id: i64,
    /// Canonical user name (first letter upper-cased)
    pub user_name: String,
}

impl MediaWikiUser {
    /// Check `password` for `user`.
    ///
    /// The first letter of `user` is upper-cased, as MediaWiki does. Unknown
    /// users and wrong passwords both give [`ChimeDbError::Authentication`];
    /// a stored hash in any other format is a [`ChimeDbError::Validation`].
    pub fn authenticate(user: &str, password: &str) -> ChimeDbResult<Self> {
        let user_name = canonical_user_name(user)?;

        let rows = PROXY.query(
            &format!("SELECT user_id, user_password FROM {TABLE} WHERE user_name = $1"),
            &[Value::from(user_name.as_str())],
        )?;
        let Some(row) = rows.into_iter().next() else {
            tracing::debug!(user = %user_name, "Unknown wiki user");
            return Err(ChimeDbError::authentication(WRONG_CREDENTIALS));
        };

        let user_id = row.try_i64("user_id")?;
        let stored = match row.get_by_name("user_password") {
            Some(Value::Blob(bytes)) => String::from_utf8_lossy(bytes).into_owned(),
            _ => row.try_str("user_password")?.to_string(),
        };

        if !verify_b_hash(&user_name, &stored, password)? {
            return Err(ChimeDbError::authentication(WRONG_CREDENTIALS));
        }
        Ok(Self { user_id, user_name })
    }
}

fn canonical_user_name(user: &str) -> ChimeDbResult<String> {
    let mut chars = user.chars();
    match chars.next() {
        Some(first) => Ok(first.to_uppercase().chain(chars).collect()),
        None => Err(ChimeDbError::authentication("Invalid value for username: ''")),
    }
}

fn verify_b_hash(user_name: &str, stored: &str, password: &str) -> ChimeDbResult<bool> {
    let parts: Vec<&str> = stored.split(':').collect();
    let [_, "B", salt, hash] = parts.as_slice() else {
        return Err(ChimeDbError::validation(format!(
            "'user_password' field for user '{user_name}' has unknown format"
        )));
    };

    let inner = format!("{:x}", md5::compute(password.as_bytes()));
    let salted = format!("{:x}", md5::compute(format!("{salt}-{inner}")));
    Ok(salted == *hash)
}
