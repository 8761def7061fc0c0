use std::path::{Path, PathBuf};

pub const SOCKET_ENV: &str = "MIMA_SOCKET";
const SOCKET_DIR_NAME: &str = "mima";
const SOCKET_FILE_NAME: &str = "authority.sock";

/// `<runtime dir>/mima/authority.sock`, falling back to the cache dir and then
/// the temp dir on platforms without a runtime dir.
fn default_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::cache_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join(SOCKET_DIR_NAME)
        .join(SOCKET_FILE_NAME)
}

pub fn socket_path_from_env() -> PathBuf {
    std::env::var(SOCKET_ENV)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(default_socket_path)
}

/// `--socket` wins over the environment.
pub fn resolve_socket_path(flag: Option<&Path>) -> PathBuf {
    flag.map_or_else(socket_path_from_env, Path::to_path_buf)
}
