//! Request dispatch: static files, plus the two POST endpoints backed by the
//! user store.

use serde::Deserialize;
use std::path::PathBuf;

use crate::http::{Method, Status};
use crate::resource::{self, MappedFile, ResourceError};
use crate::store::UserStore;

/// Paths of the form endpoints and the pages they answer with.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RoutesConfig {
    pub login: String,
    pub register: String,
    pub welcome_page: String,
    pub login_page: String,
    pub login_error_page: String,
    pub register_error_page: String,
}

impl Default for RoutesConfig {
    fn default() -> Self {
        Self {
            login: "/login".to_string(),
            register: "/register".to_string(),
            welcome_page: "/welcome.html".to_string(),
            login_page: "/log.html".to_string(),
            login_error_page: "/logError.html".to_string(),
            register_error_page: "/registerError.html".to_string(),
        }
    }
}

impl RoutesConfig {
    pub fn paths(&self) -> [(&'static str, &str); 6] {
        [
            ("login", &self.login),
            ("register", &self.register),
            ("welcome_page", &self.welcome_page),
            ("login_page", &self.login_page),
            ("login_error_page", &self.login_error_page),
            ("register_error_page", &self.register_error_page),
        ]
    }
}

#[derive(Debug)]
pub enum Reply {
    File(MappedFile),
    Error(Status),
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    doc_root: PathBuf,
    default_document: String,
    routes: RoutesConfig,
}

impl Dispatcher {
    pub fn new(doc_root: impl Into<PathBuf>, default_document: &str, routes: RoutesConfig) -> Self {
        Self {
            doc_root: doc_root.into(),
            default_document: default_document.to_string(),
            routes,
        }
    }

    pub fn default_document(&self) -> &str {
        &self.default_document
    }

    pub fn dispatch<S: UserStore + ?Sized>(
        &self,
        method: Method,
        target: &str,
        body: &[u8],
        store: &mut S,
    ) -> Reply {
        if method == Method::Post {
            if target == self.routes.login {
                return self.login(body, store);
            }
            if target == self.routes.register {
                return self.register(body, store);
            }
        }
        self.serve(target)
    }

    fn login<S: UserStore + ?Sized>(&self, body: &[u8], store: &mut S) -> Reply {
        let Some((user, password)) = parse_credentials(body) else {
            return Reply::Error(Status::BadRequest);
        };
        match store.password_of(user) {
            Ok(Some(stored)) if stored == password => {
                tracing::debug!(user, "login accepted");
                self.serve(&self.routes.welcome_page)
            }
            Ok(_) => {
                tracing::debug!(user, "login rejected");
                self.serve(&self.routes.login_error_page)
            }
            Err(e) => {
                tracing::error!(user, error = %e, "login lookup failed");
                Reply::Error(Status::InternalError)
            }
        }
    }

    fn register<S: UserStore + ?Sized>(&self, body: &[u8], store: &mut S) -> Reply {
        let Some((user, password)) = parse_credentials(body) else {
            return Reply::Error(Status::BadRequest);
        };
        match store.insert(user, password) {
            Ok(true) => {
                tracing::info!(user, "user registered");
                self.serve(&self.routes.login_page)
            }
            Ok(false) => self.serve(&self.routes.register_error_page),
            Err(e) => {
                tracing::error!(user, error = %e, "registration failed");
                Reply::Error(Status::InternalError)
            }
        }
    }

    fn serve(&self, target: &str) -> Reply {
        match resource::resolve(&self.doc_root, target) {
            Ok(file) => Reply::File(file),
            Err(ResourceError::Missing(path)) => {
                tracing::debug!(path = %path.display(), "resource missing");
                Reply::Error(Status::NotFound)
            }
            Err(ResourceError::Forbidden(path)) => {
                tracing::debug!(path = %path.display(), "resource forbidden");
                Reply::Error(Status::Forbidden)
            }
            Err(ResourceError::Directory(_)) => Reply::Error(Status::BadRequest),
            Err(e @ ResourceError::Io { .. }) => {
                tracing::error!(error = %e, "resource mapping failed");
                Reply::Error(Status::InternalError)
            }
        }
    }
}

/// Split a `user=<name>&password=<pass>` form body.
///
/// Fields are taken by position: the name runs from byte 5 to the first
/// `&`, the password starts 10 bytes after that `&` (past `&password=`).
pub fn parse_credentials(body: &[u8]) -> Option<(&str, &str)> {
    const NAME_START: usize = "user=".len();
    const PASSWORD_SKIP: usize = "&password=".len();

    let rest = body.get(NAME_START..)?;
    let amp = NAME_START + memchr::memchr(b'&', rest)?;
    let password = body.get(amp + PASSWORD_SKIP..)?;
    let name = std::str::from_utf8(&body[NAME_START..amp]).ok()?;
    let password = std::str::from_utf8(password).ok()?;
    Some((name, password))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Backend, BackendConfig, BackendError, MemoryBackend};
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn docroot() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, body) in [
            ("judge.html", "judge"),
            ("welcome.html", "welcome"),
            ("log.html", "log"),
            ("logError.html", "log error"),
            ("registerError.html", "register error"),
        ] {
            let path = dir.path().join(name);
            fs::write(&path, body).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        }
        dir
    }

    fn body_of(reply: Reply) -> String {
        match reply {
            Reply::File(file) => String::from_utf8(file.as_bytes().to_vec()).unwrap(),
            Reply::Error(status) => panic!("expected a file, got {status:?}"),
        }
    }

    struct BrokenStore;

    impl UserStore for BrokenStore {
        fn password_of(&mut self, _: &str) -> Result<Option<String>, BackendError> {
            Err(BackendError::Query("connection lost".into()))
        }
        fn insert(&mut self, _: &str, _: &str) -> Result<bool, BackendError> {
            Err(BackendError::Query("connection lost".into()))
        }
    }

    #[test]
    fn test_parse_credentials_by_offset() {
        assert_eq!(parse_credentials(b"user=alice&password=pw"), Some(("alice", "pw")));
        assert_eq!(parse_credentials(b"user=&password="), Some(("", "")));
        assert_eq!(parse_credentials(b"user=alice"), None);
        assert_eq!(parse_credentials(b"user=alice&pass"), None);
        assert_eq!(parse_credentials(b"usr"), None);
    }

    #[test]
    fn test_login_and_register() {
        let dir = docroot();
        let dispatcher = Dispatcher::new(dir.path(), "judge.html", RoutesConfig::default());
        let backend = MemoryBackend::new().with_user("alice", "pw");
        let mut conn = backend.connect(&BackendConfig::default()).unwrap();

        let ok = dispatcher.dispatch(Method::Post, "/login", b"user=alice&password=pw", &mut conn);
        assert_eq!(body_of(ok), "welcome");
        let bad = dispatcher.dispatch(Method::Post, "/login", b"user=alice&password=no", &mut conn);
        assert_eq!(body_of(bad), "log error");

        let new = dispatcher.dispatch(Method::Post, "/register", b"user=bob&password=b1", &mut conn);
        assert_eq!(body_of(new), "log");
        let dup = dispatcher.dispatch(Method::Post, "/register", b"user=bob&password=b2", &mut conn);
        assert_eq!(body_of(dup), "register error");
        assert_eq!(backend.user_count(), 2);
    }

    #[test]
    fn test_store_failure_is_internal_error() {
        let dir = docroot();
        let dispatcher = Dispatcher::new(dir.path(), "judge.html", RoutesConfig::default());
        let reply = dispatcher.dispatch(Method::Post, "/login", b"user=a&password=b", &mut BrokenStore);
        assert!(matches!(reply, Reply::Error(Status::InternalError)));
    }

    #[test]
    fn test_get_on_form_route_serves_static() {
        let dir = docroot();
        let dispatcher = Dispatcher::new(dir.path(), "judge.html", RoutesConfig::default());
        let reply = dispatcher.dispatch(Method::Get, "/login", b"", &mut BrokenStore);
        assert!(matches!(reply, Reply::Error(Status::NotFound)));
        let reply = dispatcher.dispatch(Method::Get, "/judge.html", b"", &mut BrokenStore);
        assert_eq!(body_of(reply), "judge");
    }
}
