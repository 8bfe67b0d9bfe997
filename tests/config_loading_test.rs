use quorumlb::config::DaemonConfig;
use std::io::Write;

fn write_temp_toml(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn loads_minimal_single_service_config() {
    let file = write_temp_toml(
        r#"
        [global]
        kernel_tool_path = "/sbin/ipvsadm"

        [services.web]
        protocol = "tcp"
        ip = "10.0.0.1"
        port = 80
        scheduler = "wrr"
        config = "file:///etc/quorumlb/web.json"
        monitors = ["idle_connection"]
        "#,
    );
    let config = DaemonConfig::from_file(file.path().to_str().unwrap()).unwrap();
    assert_eq!(config.services.len(), 1);
    assert_eq!(config.services[0].name, "web");
    assert_eq!(config.services[0].port, 80);
    assert!(config.bgp.is_none());
}

#[test]
fn comma_separated_ip_expands_into_multiple_services() {
    let file = write_temp_toml(
        r#"
        [global]
        kernel_tool_path = "/sbin/ipvsadm"

        [services.web]
        protocol = "tcp"
        ip = "10.0.0.1,10.0.0.2,10.0.0.3"
        port = 443
        scheduler = "wlc"
        config = "file:///etc/quorumlb/web.json"
        monitors = []
        "#,
    );
    let config = DaemonConfig::from_file(file.path().to_str().unwrap()).unwrap();
    let names: Vec<&str> = config.services.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["web", "web_1", "web_2"]);
}

#[test]
fn bgp_enabled_service_requires_global_bgp_fields() {
    let file = write_temp_toml(
        r#"
        [global]
        kernel_tool_path = "/sbin/ipvsadm"

        [services.web]
        protocol = "tcp"
        ip = "10.0.0.1"
        port = 80
        scheduler = "wrr"
        config = "file:///etc/quorumlb/web.json"
        monitors = []
        bgp = true
        "#,
    );
    let err = DaemonConfig::from_file(file.path().to_str().unwrap()).unwrap_err();
    assert!(err.to_string().contains("bgp_local_asn"));
}

#[test]
fn bgp_config_is_populated_when_fields_present() {
    let file = write_temp_toml(
        r#"
        [global]
        kernel_tool_path = "/sbin/ipvsadm"
        bgp_local_asn = 65010
        bgp_local_bgp_id = "192.0.2.1"
        bgp_peer_addresses = ["192.0.2.2"]

        [services.web]
        protocol = "tcp"
        ip = "10.0.0.1"
        port = 80
        scheduler = "wrr"
        config = "file:///etc/quorumlb/web.json"
        monitors = []
        bgp = true
        "#,
    );
    let config = DaemonConfig::from_file(file.path().to_str().unwrap()).unwrap();
    let bgp = config.bgp.unwrap();
    assert_eq!(bgp.local_asn, 65010);
    assert_eq!(bgp.peer_addresses.len(), 1);
}
