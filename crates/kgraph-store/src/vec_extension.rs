//! Process-wide registration of the sqlite-vec extension.
//!
//! SQLite only exposes automatic extensions as a global C hook, so this is
//! the one place in the crate that touches `unsafe`.

use std::sync::Once;

static REGISTERED: Once = Once::new();

/// Register sqlite-vec with every SQLite connection opened afterwards.
/// Repeated calls are no-ops.
pub(crate) fn register() {
    REGISTERED.call_once(|| {
        // SAFETY: `sqlite3_vec_init` has the entry-point signature
        // `sqlite3_auto_extension` expects; the crate exports it untyped.
        unsafe {
            rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
                sqlite_vec::sqlite3_vec_init as *const (),
            )));
        }
    });
}

#[cfg(test)]
mod tests {
    use rusqlite::Connection;

    use super::*;

    #[test]
    fn connections_opened_after_registration_load_the_extension() {
        register();
        register();
        let conn = Connection::open_in_memory().unwrap();
        let version: String = conn.query_row("SELECT vec_version()", [], |row| row.get(0)).unwrap();
        assert!(version.starts_with('v'));

        conn.execute_batch("CREATE VIRTUAL TABLE v USING vec0(embedding float[2])")
            .unwrap();
    }
}
