use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crawler::manifest::sha256_hex;
use crawler::{CrawlerConfig, Harvester};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PDF_BODY: &[u8] = b"%PDF-1.4\nfixture minutes body\n%%EOF";

fn html(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("Content-Type", "text/html; charset=utf-8")
        .set_body_string(body.to_string())
}

fn pdf() -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("Content-Type", "application/pdf")
        .set_body_bytes(PDF_BODY.to_vec())
}

fn write_input(dir: &Path, seed_url: &str) -> PathBuf {
    let input = dir.join("minute_link_list.json");
    let mut parent = serde_json::Map::new();
    parent.insert(seed_url.to_string(), serde_json::json!(6));
    let body = serde_json::json!([{
        "prefecture": "山形県",
        "city": "山辺町",
        "parent": parent,
        "grand_parent": {}
    }]);
    std::fs::write(&input, serde_json::to_string_pretty(&body).unwrap()).unwrap();
    input
}

fn test_config(outdir: &Path, input: PathBuf) -> CrawlerConfig {
    let mut config = CrawlerConfig::for_outdir(outdir);
    config.input = input;
    config.delay = Duration::ZERO;
    config.workers = 4;
    config
}

fn manifest_events(config: &CrawlerConfig) -> Vec<serde_json::Value> {
    let raw = std::fs::read_to_string(&config.manifest_path).unwrap();
    raw.lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

fn count_events(events: &[serde_json::Value], kind: &str) -> usize {
    events.iter().filter(|e| e["event"] == kind).count()
}

#[tokio::test]
async fn single_seed_two_pages_one_pdf() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/idx"))
        .respond_with(html(
            r#"<html><body>
                <a href="minutes.pdf">議事録</a>
                <a href="other.html">その他の会議</a>
            </body></html>"#,
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/other.html"))
        .respond_with(html("<html><body>リンクなし</body></html>"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/minutes.pdf"))
        .respond_with(pdf())
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), &format!("{}/idx", server.uri()));
    let config = test_config(&dir.path().join("out"), input);
    let summary = Harvester::new(config.clone()).run().await.unwrap();

    assert_eq!(summary.seeds_total, 1);
    assert_eq!(summary.seeds_skipped, 0);
    assert_eq!(summary.pages_fetched, 2);
    assert_eq!(summary.files_downloaded, 1);

    let events = manifest_events(&config);
    assert_eq!(count_events(&events, "page_saved"), 2);
    assert_eq!(count_events(&events, "downloaded_file"), 1);
    assert_eq!(count_events(&events, "seed_done"), 1);

    let downloaded = events
        .iter()
        .find(|e| e["event"] == "downloaded_file")
        .unwrap();
    assert_eq!(downloaded["content_sha256"], sha256_hex(PDF_BODY));
    let saved_path = PathBuf::from(downloaded["path"].as_str().unwrap());
    assert_eq!(saved_path.file_name().unwrap(), "minutes.pdf");
    assert_eq!(std::fs::read(&saved_path).unwrap(), PDF_BODY);

    // link_found{file} precedes downloaded_file for the same seed.
    let link_pos = events
        .iter()
        .position(|e| e["event"] == "link_found" && e["kind"] == "file")
        .unwrap();
    let dl_pos = events
        .iter()
        .position(|e| e["event"] == "downloaded_file")
        .unwrap();
    assert!(link_pos < dl_pos);
}

#[tokio::test]
async fn robots_disallow_is_honored_and_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /private/\n"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/idx"))
        .respond_with(html(
            r#"<html><body>
                <a href="/private/minutes.pdf">議事録（非公開）</a>
                <a href="/public/minutes.pdf">議事録（公開）</a>
            </body></html>"#,
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/public/minutes.pdf"))
        .respond_with(pdf())
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), &format!("{}/idx", server.uri()));
    let config = test_config(&dir.path().join("out"), input);
    let summary = Harvester::new(config.clone()).run().await.unwrap();

    assert_eq!(summary.files_downloaded, 1);
    assert_eq!(summary.robots_denied, 1);

    let events = manifest_events(&config);
    assert_eq!(count_events(&events, "downloaded_file"), 1);
    assert_eq!(count_events(&events, "robots_denied"), 1);
    let denied = events
        .iter()
        .find(|e| e["event"] == "robots_denied")
        .unwrap();
    assert_eq!(denied["path_prefix"], "/private");

    // The denied URL was never requested.
    let private_hits = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/private/minutes.pdf")
        .count();
    assert_eq!(private_hits, 0);

    let host = denied["host"].as_str().unwrap().to_string();
    let by_domain =
        std::fs::read_to_string(config.report_dir.join("robots_disallow_by_domain.csv")).unwrap();
    assert!(by_domain.contains(&host));
    let by_prefix =
        std::fs::read_to_string(config.report_dir.join("robots_disallow_by_path_prefix.csv"))
            .unwrap();
    assert!(by_prefix.contains("/private"));
    let urls =
        std::fs::read_to_string(config.report_dir.join("robots_disallow_urls.jsonl")).unwrap();
    assert_eq!(urls.lines().count(), 1);
}

#[tokio::test]
async fn resume_skips_unchanged_seed() {
    let server = MockServer::start().await;
    // More specific conditional mock first: wiremock picks the first match.
    Mock::given(method("GET"))
        .and(path("/idx"))
        .and(header("If-None-Match", "\"v1\""))
        .respond_with(ResponseTemplate::new(304))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/idx"))
        .respond_with(
            html(r#"<html><body><a href="minutes.pdf">議事録</a></body></html>"#)
                .insert_header("ETag", "\"v1\""),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/minutes.pdf"))
        .respond_with(pdf())
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), &format!("{}/idx", server.uri()));
    let config = test_config(&dir.path().join("out"), input);

    let first = Harvester::new(config.clone()).run().await.unwrap();
    assert_eq!(first.files_downloaded, 1);
    let run1_len = manifest_events(&config).len();
    let run1_requests = server.received_requests().await.unwrap().len();

    let second = Harvester::new(config.clone()).run().await.unwrap();
    assert_eq!(second.seeds_skipped, 1);
    assert_eq!(second.files_downloaded, 0);

    let events = manifest_events(&config);
    let run2 = &events[run1_len..];
    assert_eq!(count_events(run2, "seed_skipped"), 1);
    let skip = run2.iter().find(|e| e["event"] == "seed_skipped").unwrap();
    assert_eq!(skip["reason"], "completed_unchanged");
    assert_eq!(count_events(run2, "downloaded_file"), 0);
    assert_eq!(count_events(run2, "page_saved"), 0);
    assert_eq!(count_events(run2, "seed_started"), 0);

    // Run 2 touched at most robots.txt and the seed's conditional GET.
    let requests = server.received_requests().await.unwrap();
    for request in &requests[run1_requests..] {
        assert!(
            request.url.path() == "/idx" || request.url.path() == "/robots.txt",
            "unexpected fetch during skip: {}",
            request.url
        );
    }
}

#[tokio::test]
async fn changed_seed_recrawls_without_refetching_payloads() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/idx"))
        .respond_with(
            html(r#"<html><body><a href="minutes.pdf">議事録</a></body></html>"#)
                .insert_header("ETag", "\"v1\""),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/minutes.pdf"))
        .respond_with(pdf())
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), &format!("{}/idx", server.uri()));
    let config = test_config(&dir.path().join("out"), input);

    let first = Harvester::new(config.clone()).run().await.unwrap();
    assert_eq!(first.files_downloaded, 1);
    let run1_len = manifest_events(&config).len();

    // The index rotates its ETag and gains one new payload link.
    server.reset().await;
    Mock::given(method("GET"))
        .and(path("/idx"))
        .respond_with(
            html(
                r#"<html><body>
                    <a href="minutes.pdf">議事録</a>
                    <a href="minutes_r7.pdf">議事録（令和7年）</a>
                </body></html>"#,
            )
            .insert_header("ETag", "\"v2\""),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/minutes_r7.pdf"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "application/pdf")
                .set_body_bytes(b"%PDF-1.4 newer fixture".to_vec()),
        )
        .mount(&server)
        .await;

    let second = Harvester::new(config.clone()).run().await.unwrap();
    assert_eq!(second.seeds_skipped, 0);
    assert_eq!(second.files_downloaded, 1);

    let events = manifest_events(&config);
    let run2 = &events[run1_len..];
    assert_eq!(count_events(run2, "seed_started"), 1);
    assert_eq!(count_events(run2, "seed_done"), 1);
    let downloads: Vec<_> = run2
        .iter()
        .filter(|e| e["event"] == "downloaded_file")
        .collect();
    assert_eq!(downloads.len(), 1);
    assert!(downloads[0]["url"]
        .as_str()
        .unwrap()
        .ends_with("minutes_r7.pdf"));

    // The previously downloaded payload was not re-fetched after reset.
    let old_pdf_hits = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/minutes.pdf")
        .count();
    assert_eq!(old_pdf_hits, 0);
}

#[tokio::test]
async fn no_download_records_links_without_files() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/idx"))
        .respond_with(html(
            r#"<html><body><a href="minutes.pdf">議事録</a></body></html>"#,
        ))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), &format!("{}/idx", server.uri()));
    let mut config = test_config(&dir.path().join("out"), input);
    config.save_pages = false;
    config.download_files = false;

    let summary = Harvester::new(config.clone()).run().await.unwrap();
    assert_eq!(summary.files_downloaded, 0);

    let events = manifest_events(&config);
    assert_eq!(count_events(&events, "link_found"), 1);
    assert_eq!(count_events(&events, "downloaded_file"), 0);
    assert_eq!(count_events(&events, "page_saved"), 0);
    assert_eq!(count_events(&events, "seed_done"), 1);

    let pdf_hits = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/minutes.pdf")
        .count();
    assert_eq!(pdf_hits, 0);
}

#[tokio::test]
async fn same_domain_scope_keeps_foreign_hosts_untouched() {
    let server = MockServer::start().await;
    let foreign = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/idx"))
        .respond_with(html(&format!(
            r#"<html><body>
                <a href="{0}/gikai/minutes.pdf">議事録（別サイト）</a>
                <a href="{0}/gikai/">別サイトの議会</a>
                <a href="local.html">会議のページ</a>
            </body></html>"#,
            foreign.uri()
        )))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/local.html"))
        .respond_with(html("<html><body>同一ドメイン</body></html>"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), &format!("{}/idx", server.uri()));
    let config = test_config(&dir.path().join("out"), input);
    let summary = Harvester::new(config.clone()).run().await.unwrap();

    assert_eq!(summary.pages_fetched, 2);
    assert!(foreign.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn depth_and_page_caps_bound_the_crawl() {
    let server = MockServer::start().await;
    // idx -> d1 -> d2 -> d3; with max_depth = 2 the d3 page stays unvisited.
    Mock::given(method("GET"))
        .and(path("/idx"))
        .respond_with(html(r#"<a href="d1.html">会議 1</a>"#))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/d1.html"))
        .respond_with(html(r#"<a href="d2.html">会議 2</a>"#))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/d2.html"))
        .respond_with(html(r#"<a href="d3.html">会議 3</a>"#))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/d3.html"))
        .respond_with(html("too deep"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), &format!("{}/idx", server.uri()));
    let config = test_config(&dir.path().join("out"), input);
    let summary = Harvester::new(config.clone()).run().await.unwrap();

    assert_eq!(summary.pages_fetched, 3);
    let d3_hits = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/d3.html")
        .count();
    assert_eq!(d3_hits, 0);
}

#[tokio::test]
async fn per_host_delay_spaces_fetches() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/idx"))
        .respond_with(html(
            r#"<a href="a.html">会議 a</a><a href="b.html">会議 b</a>"#,
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/a.html"))
        .respond_with(html("a"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/b.html"))
        .respond_with(html("b"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), &format!("{}/idx", server.uri()));
    let mut config = test_config(&dir.path().join("out"), input);
    config.delay = Duration::from_millis(250);

    let start = Instant::now();
    let summary = Harvester::new(config).run().await.unwrap();
    assert_eq!(summary.pages_fetched, 3);
    // Three fetches to one host leave at least two full delay windows.
    assert!(start.elapsed() >= Duration::from_millis(500));
}

#[tokio::test]
async fn seed_denied_by_robots_is_skipped_without_validator() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /\n"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/idx"))
        .respond_with(html("should never be fetched"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), &format!("{}/idx", server.uri()));
    let config = test_config(&dir.path().join("out"), input);
    let summary = Harvester::new(config.clone()).run().await.unwrap();

    assert_eq!(summary.seeds_skipped, 1);
    let events = manifest_events(&config);
    let skip = events
        .iter()
        .find(|e| e["event"] == "seed_skipped")
        .unwrap();
    assert_eq!(skip["reason"], "robots_denied");
    assert_eq!(count_events(&events, "seed_done"), 0);

    let idx_hits = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/idx")
        .count();
    assert_eq!(idx_hits, 0);
}
