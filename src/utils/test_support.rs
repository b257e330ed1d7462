/// Returns `true` when the sandbox forbids binding a loopback socket, in which
/// case HTTP mock tests return early instead of failing.
pub fn loopback_blocked() -> bool {
    match std::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0)) {
        Ok(_) => false,
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            eprintln!("skipping http mock test: cannot bind loopback ({err})");
            true
        }
        Err(err) => panic!("unexpected loopback bind failure: {err}"),
    }
}
