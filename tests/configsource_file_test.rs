use quorumlb::core::configsource::file::FileConfigSource;
use quorumlb::core::configsource::ConfigSource;
use std::io::Write;
use std::time::Duration;

#[tokio::test]
async fn picks_up_initial_content_and_subsequent_changes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pool.json");
    std::fs::write(&path, r#"[{"host": "10.0.0.1", "weight": 10, "enabled": true}]"#).unwrap();

    let mut source = FileConfigSource::new(path.to_string_lossy().into_owned());
    let first = tokio::time::timeout(Duration::from_secs(5), source.next()).await.unwrap().unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].host, "10.0.0.1");
    assert!(first[0].enabled);

    // Give the poll loop's mtime a chance to tick forward before rewriting.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let mut file = std::fs::OpenOptions::new().write(true).truncate(true).open(&path).unwrap();
    write!(
        file,
        r#"[{{"host": "10.0.0.1", "weight": 10, "enabled": false}}, {{"host": "10.0.0.2", "weight": 5, "enabled": true}}]"#
    )
    .unwrap();
    file.flush().unwrap();
    drop(file);

    let second = tokio::time::timeout(Duration::from_secs(5), source.next()).await.unwrap().unwrap();
    assert_eq!(second.len(), 2);
    assert!(!second.iter().find(|e| e.host == "10.0.0.1").unwrap().enabled);
}

#[tokio::test]
async fn legacy_mapping_format_is_parsed_when_no_json_suffix() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pool.txt");
    std::fs::write(
        &path,
        "{host: \"a.example.com\", weight: 10, enabled: true}\n{host: \"b.example.com\", weight: 5, enabled: false}\n",
    )
    .unwrap();

    let mut source = FileConfigSource::new(path.to_string_lossy().into_owned());
    let desired = tokio::time::timeout(Duration::from_secs(5), source.next()).await.unwrap().unwrap();
    assert_eq!(desired.len(), 2);
    assert_eq!(desired[0].host, "a.example.com");
    assert!(!desired[1].enabled);
}
