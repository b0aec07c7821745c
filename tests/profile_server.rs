mod common;

use common::*;
use std::{fs, sync::Arc};
use tempfile::tempdir;
use tunup::{
    scheduler::{should_refresh, unix_now},
    store::{ProfileKind, ProfileStore},
};

const URL: &str = "https://sub.example.com/work.yml";
const MAX_BODY: usize = 1 << 20;

fn dir_entries(dir: &std::path::Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .map(|rd| {
            rd.flatten()
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

#[test]
fn get_renders_empty_download_tab() {
    let tmp = tempdir().unwrap();
    let addr = spawn_server(tmp.path(), Arc::new(StaticFetcher::default()), MAX_BODY);

    let r = get(addr, "/");
    assert_eq!(r.status, 200);
    assert!(r.body.contains("id=\"tab-download\" checked"));
    assert!(r.body.contains("name=\"name\" value=\"\""));
    assert!(!r.body.contains("class=\"status"));
    assert!(dir_entries(tmp.path()).is_empty());

    assert_eq!(get(addr, "/?tab=upload").status, 200);
    assert_eq!(get(addr, "/profiles").status, 404);
}

#[test]
fn download_then_refresh_becomes_due_after_interval() {
    let tmp = tempdir().unwrap();
    let fetcher = StaticFetcher::with(URL, WORK_BODY);
    let addr = spawn_server(tmp.path(), fetcher.clone(), MAX_BODY);

    let before = unix_now();
    let r = post_form(
        addr,
        &[
            Part::Field("action", "download"),
            Part::Field("name", "work"),
            Part::Field("url", URL),
            Part::Field("interval", "3600"),
        ],
    );
    assert_eq!(r.status, 200);
    assert!(r.body.contains("File downloaded successfully."), "{}", r.body);
    assert!(r.body.contains("value=\"3600\""));

    assert_eq!(fs::read_to_string(tmp.path().join("work.yml")).unwrap(), WORK_BODY);
    let meta_text = fs::read_to_string(tmp.path().join("work.meta.yml")).unwrap();
    assert!(meta_text.contains("type: download"));
    assert!(meta_text.contains("update_interval: 3600"));
    assert_eq!(dir_entries(tmp.path()), vec!["work.meta.yml", "work.yml"]);

    let meta = ProfileStore::new(tmp.path()).read_meta("work").unwrap();
    assert_eq!(meta.kind(), ProfileKind::Download);
    assert_eq!(meta.source_url(), Some(URL));
    assert!(meta.last_update() >= before);
    assert!(!should_refresh(&meta, meta.last_update()));
    assert!(should_refresh(&meta, meta.last_update() + 3601));
    assert_eq!(*fetcher.calls.lock().unwrap(), vec![URL.to_string()]);
}

#[test]
fn failed_download_leaves_no_partial_profile() {
    let tmp = tempdir().unwrap();
    let addr = spawn_server(tmp.path(), Arc::new(StaticFetcher::default()), MAX_BODY);

    let r = post_form(
        addr,
        &[
            Part::Field("action", "download"),
            Part::Field("name", "work"),
            Part::Field("url", "http://unreachable.example/x.yml"),
            Part::Field("interval", "0"),
        ],
    );
    assert_eq!(r.status, 200);
    assert!(r.body.contains("Error downloading file: "), "{}", r.body);
    assert!(r.body.contains("unreachable.example"));
    assert!(dir_entries(tmp.path()).is_empty());
}

#[test]
fn failed_download_keeps_previous_content() {
    let tmp = tempdir().unwrap();
    let fetcher = StaticFetcher::with(URL, WORK_BODY);
    let addr = spawn_server(tmp.path(), fetcher.clone(), MAX_BODY);
    let form = [
        Part::Field("action", "download"),
        Part::Field("name", "work"),
        Part::Field("url", URL),
        Part::Field("interval", "60"),
    ];
    assert!(post_form(addr, &form).body.contains("File downloaded successfully."));
    let meta_before = fs::read(tmp.path().join("work.meta.yml")).unwrap();

    fetcher.forget(URL);
    let r = post_form(addr, &form);
    assert!(r.body.contains("Error downloading file: "));
    assert_eq!(fs::read_to_string(tmp.path().join("work.yml")).unwrap(), WORK_BODY);
    assert_eq!(fs::read(tmp.path().join("work.meta.yml")).unwrap(), meta_before);
    assert_eq!(dir_entries(tmp.path()), vec!["work.meta.yml", "work.yml"]);
}

#[test]
fn upload_rejects_non_yml_files() {
    let tmp = tempdir().unwrap();
    let addr = spawn_server(tmp.path(), Arc::new(StaticFetcher::default()), MAX_BODY);

    let r = post_form(
        addr,
        &[
            Part::Field("action", "upload"),
            Part::Field("name", "bad"),
            Part::File("file", "bad.txt", WORK_BODY.as_bytes()),
        ],
    );
    assert_eq!(r.status, 200);
    assert!(r.body.contains("Invalid file type. Only .yml files are accepted."));
    assert!(r.body.contains("id=\"tab-upload\" checked"));
    assert!(!tmp.path().join("bad.yml").exists());
    assert!(!tmp.path().join("bad.meta.yml").exists());
}

#[test]
fn upload_stores_bytes_verbatim() {
    let tmp = tempdir().unwrap();
    let addr = spawn_server(tmp.path(), Arc::new(StaticFetcher::default()), MAX_BODY);
    let data = b"# keep me\r\nproxies: []\nproxy-groups: []\nrules: []\n";

    let before = unix_now();
    let r = post_form(
        addr,
        &[
            Part::Field("action", "upload"),
            Part::Field("name", "home"),
            Part::File("file", "anything.yml", data),
        ],
    );
    assert_eq!(r.status, 200);
    assert!(r.body.contains("File uploaded successfully."), "{}", r.body);
    assert_eq!(fs::read(tmp.path().join("home.yml")).unwrap(), data);

    let meta = ProfileStore::new(tmp.path()).read_meta("home").unwrap();
    assert_eq!(meta.kind(), ProfileKind::Upload);
    assert!(meta.last_update() >= before);
}

#[test]
fn upload_without_name_is_refused() {
    let tmp = tempdir().unwrap();
    let addr = spawn_server(tmp.path(), Arc::new(StaticFetcher::default()), MAX_BODY);
    let r = post_form(
        addr,
        &[
            Part::Field("action", "upload"),
            Part::Field("name", " "),
            Part::File("file", "travel.yml", WORK_BODY.as_bytes()),
        ],
    );
    assert_eq!(r.status, 200);
    assert!(r.body.contains("Error uploading file: profile name is required"), "{}", r.body);
    assert!(dir_entries(tmp.path()).is_empty());
}

#[test]
fn traversal_names_are_refused() {
    let tmp = tempdir().unwrap();
    let profiles = tmp.path().join("profiles");
    fs::create_dir_all(&profiles).unwrap();
    let fetcher = StaticFetcher::with(URL, WORK_BODY);
    let addr = spawn_server(&profiles, fetcher.clone(), MAX_BODY);

    let r = post_form(
        addr,
        &[
            Part::Field("action", "download"),
            Part::Field("name", "../escape"),
            Part::Field("url", URL),
        ],
    );
    assert!(r.body.contains("Error downloading file: invalid profile name"));
    assert!(r.body.contains("value=\"../escape\""));
    assert!(!tmp.path().join("escape.yml").exists());
    assert!(fetcher.calls.lock().unwrap().is_empty());
}

#[test]
fn shell_metacharacters_in_url_are_inert() {
    let tmp = tempdir().unwrap();
    let url = "http://h.example/x.yml;touch${IFS}pwned";
    let fetcher = StaticFetcher::with(url, WORK_BODY);
    let addr = spawn_server(tmp.path(), fetcher.clone(), MAX_BODY);

    let r = post_form(
        addr,
        &[
            Part::Field("action", "download"),
            Part::Field("name", "odd"),
            Part::Field("url", url),
        ],
    );
    assert!(r.body.contains("File downloaded successfully."));
    assert_eq!(*fetcher.calls.lock().unwrap(), vec![url.to_string()]);
    assert!(r.body.contains("x.yml;touch${IFS}pwned"));
}

#[test]
fn unknown_action_gets_400() {
    let tmp = tempdir().unwrap();
    let addr = spawn_server(tmp.path(), Arc::new(StaticFetcher::default()), MAX_BODY);

    let r = post_form(
        addr,
        &[Part::Field("action", "delete"), Part::Field("name", "work")],
    );
    assert_eq!(r.status, 400);
    assert!(r.body.contains("Unknown action `delete`."));

    let r = send(
        addr,
        b"POST / HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 15\r\nConnection: close\r\n\r\naction=download",
    );
    assert_eq!(r.status, 400);
    assert!(dir_entries(tmp.path()).is_empty());
}

#[test]
fn oversized_body_is_refused_before_reading() {
    let tmp = tempdir().unwrap();
    let addr = spawn_server(tmp.path(), Arc::new(StaticFetcher::default()), 256);

    let r = send(
        addr,
        b"POST / HTTP/1.1\r\nContent-Type: multipart/form-data; boundary=x\r\nContent-Length: 100000\r\nConnection: close\r\n\r\n",
    );
    assert_eq!(r.status, 413);

    // The server keeps serving afterwards.
    assert_eq!(get(addr, "/").status, 200);
}
