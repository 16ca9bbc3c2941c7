use std::io::Write;
use tunnel_core::config::{ConfigStore, Direction, ServerAuth};

fn write_ini(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn loads_a_full_multi_forward_config() {
    let file = write_ini(
        "[common]\n\
         debug = false\n\
         \n\
         [edge1]\n\
         server = edge.example.net\n\
         user = alice\n\
         password = s3cr3t\n\
         port = 2222\n\
         \n\
         [web]\n\
         server = edge1\n\
         direction = local\n\
         local_ip = 127.0.0.1\n\
         local_port = 18080\n\
         remote_ip = 127.0.0.1\n\
         remote_port = 80\n\
         \n\
         [reverse-ssh]\n\
         server = edge1\n\
         direction = remote\n\
         local_ip = 127.0.0.1\n\
         local_port = 22\n\
         remote_ip = 0.0.0.0\n\
         remote_port = 22022\n\
         \n\
         [proxy]\n\
         server = edge1\n\
         direction = socks5\n\
         local_port = 11080\n\
         socks5_user = u\n\
         socks5_pass = p\n\
         \n\
         [reverse-proxy]\n\
         server = edge1\n\
         direction = reverse-socks5\n\
         remote_port = 11081\n",
    );

    let config = ConfigStore::load(file.path()).unwrap();
    assert!(!config.debug);
    assert_eq!(config.servers.len(), 1);
    assert_eq!(config.forwards.len(), 4);

    let edge1 = &config.servers["edge1"];
    assert_eq!(edge1.port, 2222);
    assert!(matches!(edge1.auth, ServerAuth::Password(ref p) if p == "s3cr3t"));

    let directions: Vec<Direction> = config.forwards.iter().map(|f| f.direction).collect();
    assert!(directions.contains(&Direction::Local));
    assert!(directions.contains(&Direction::Remote));
    assert!(directions.contains(&Direction::Socks5));
    assert!(directions.contains(&Direction::ReverseSocks5));
}

#[test]
fn forward_referencing_unknown_server_still_loads() {
    let file = write_ini(
        "[edge1]\n\
         server = edge.example.net\n\
         user = alice\n\
         password = s3cr3t\n\
         \n\
         [orphan]\n\
         server = does-not-exist\n\
         direction = local\n\
         local_port = 9000\n\
         remote_ip = 127.0.0.1\n\
         remote_port = 80\n",
    );

    let config = ConfigStore::load(file.path()).unwrap();
    assert_eq!(config.forwards.len(), 1);
    assert!(!config.servers.contains_key("does-not-exist"));
}

#[test]
fn rejects_unknown_direction() {
    let file = write_ini(
        "[edge1]\n\
         server = edge.example.net\n\
         user = alice\n\
         password = s3cr3t\n\
         \n\
         [weird]\n\
         server = edge1\n\
         direction = teleport\n",
    );

    assert!(ConfigStore::load(file.path()).is_err());
}

#[test]
fn rejects_both_password_and_private_key() {
    let file = write_ini(
        "[edge1]\n\
         server = edge.example.net\n\
         user = alice\n\
         password = s3cr3t\n\
         private_key = /home/alice/.ssh/id_ed25519\n",
    );

    assert!(ConfigStore::load(file.path()).is_err());
}
