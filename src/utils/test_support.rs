/// Returns `true` when mock HTTP servers cannot run here, either because the
/// sandbox forbids binding localhost or `DOC_RELAY_SKIP_HTTPMOCK` is set.
pub fn should_skip_httpmock() -> bool {
    if std::env::var_os("DOC_RELAY_SKIP_HTTPMOCK").is_some() {
        eprintln!("skipping httpmock test: DOC_RELAY_SKIP_HTTPMOCK is set");
        return true;
    }
    if can_bind_localhost() {
        return false;
    }
    eprintln!("skipping httpmock test: sandbox forbids binding to localhost");
    true
}

fn can_bind_localhost() -> bool {
    match std::net::TcpListener::bind(("127.0.0.1", 0)) {
        Ok(_listener) => true,
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => false,
        Err(err) => panic!("failed to bind localhost for httpmock tests: {err}"),
    }
}
