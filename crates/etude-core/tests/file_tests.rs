// File handler integration tests: conditional requests, byte ranges and
// pre-compressed variants against a temp document root.

mod common;

use std::time::UNIX_EPOCH;

use etude_core::prelude::*;

use common::start_host;

struct DocRoot {
    dir: tempfile::TempDir,
}

impl DocRoot {
    fn new() -> DocRoot {
        let dir = tempfile::tempdir().expect("docroot");
        DocRoot { dir }
    }

    fn write(&self, name: &str, content: &[u8]) {
        std::fs::write(self.dir.path().join(name), content).expect("write doc");
    }

    fn path(&self) -> &str {
        self.dir.path().to_str().expect("utf-8 path")
    }

    /// The `"<mtime>-<size>"` tag the handler will compute.
    fn etag(&self, name: &str) -> String {
        let meta = std::fs::metadata(self.dir.path().join(name)).expect("stat");
        let mtime = meta
            .modified()
            .unwrap()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        format!("\"{}-{}\"", mtime, meta.len())
    }
}

fn docs_config(root: &DocRoot) -> serde_json::Value {
    serde_json::json!({
        "listen": ["http://127.0.0.1:0"],
        "documents": root.path()
    })
}

#[test]
fn test_plain_get_and_head() {
    fiber::run(async {
        let root = DocRoot::new();
        root.write("doc.html", b"<p>hello</p>");
        let host = start_host(docs_config(&root)).await;
        let base = common::base_url(&host);

        let mut client = WebClient::new();
        let status = client.get(&format!("{}/doc.html", base)).await.unwrap();
        assert_eq!(status, 200);
        assert_eq!(client.header("Content-Type"), Some("text/html"));
        assert_eq!(client.header("Content-Length"), Some("12"));
        assert_eq!(client.header("ETag"), Some(root.etag("doc.html").as_str()));
        assert!(client.header("Last-Modified").is_some());
        assert_eq!(client.response().await.unwrap(), b"<p>hello</p>");

        let status = client
            .fetch(Method::Head, &format!("{}/doc.html", base), &[], None)
            .await
            .unwrap();
        assert_eq!(status, 200);
        assert_eq!(client.header("Content-Length"), Some("12"));
        assert_eq!(client.response().await.unwrap(), b"");
    });
}

#[test]
fn test_directory_index() {
    fiber::run(async {
        let root = DocRoot::new();
        root.write("index.html", b"home");
        let host = start_host(docs_config(&root)).await;
        let base = common::base_url(&host);

        let mut client = WebClient::new();
        let status = client.get(&format!("{}/", base)).await.unwrap();
        assert_eq!(status, 200);
        assert_eq!(client.response().await.unwrap(), b"home");
    });
}

#[test]
fn test_missing_file_is_404() {
    fiber::run(async {
        let root = DocRoot::new();
        let host = start_host(docs_config(&root)).await;
        let base = common::base_url(&host);

        let mut client = WebClient::new();
        assert_eq!(client.get(&format!("{}/nope.txt", base)).await.unwrap(), 404);
    });
}

#[test]
fn test_if_none_match_gives_304() {
    // S3: a matching If-None-Match answers 304 with no body framing.
    fiber::run(async {
        let root = DocRoot::new();
        root.write("doc.html", b"<p>hello</p>");
        let host = start_host(docs_config(&root)).await;
        let base = common::base_url(&host);
        let etag = root.etag("doc.html");

        let mut client = WebClient::new();
        let status = client
            .fetch(
                Method::Get,
                &format!("{}/doc.html", base),
                &[("If-None-Match", etag.as_str())],
                None,
            )
            .await
            .unwrap();
        assert_eq!(status, 304);
        assert_eq!(client.header("Content-Length"), None);
        assert_eq!(client.header("Transfer-Encoding"), None);
        assert_eq!(client.header("ETag"), Some(etag.as_str()));
        assert_eq!(client.response().await.unwrap(), b"");
    });
}

#[test]
fn test_if_none_match_overrides_if_modified_since() {
    // A matching If-None-Match wins even when If-Modified-Since would
    // report the entity as modified.
    fiber::run(async {
        let root = DocRoot::new();
        root.write("doc.html", b"<p>hello</p>");
        let host = start_host(docs_config(&root)).await;
        let base = common::base_url(&host);
        let etag = root.etag("doc.html");

        let mut client = WebClient::new();
        let status = client
            .fetch(
                Method::Get,
                &format!("{}/doc.html", base),
                &[
                    ("If-None-Match", etag.as_str()),
                    ("If-Modified-Since", "Thu, 01 Jan 1970 00:00:00 GMT"),
                ],
                None,
            )
            .await
            .unwrap();
        assert_eq!(status, 304);
    });
}

#[test]
fn test_if_modified_since() {
    fiber::run(async {
        let root = DocRoot::new();
        root.write("doc.html", b"<p>hello</p>");
        let host = start_host(docs_config(&root)).await;
        let base = common::base_url(&host);

        let mut client = WebClient::new();
        // Entity unchanged since a future date: 304.
        let status = client
            .fetch(
                Method::Get,
                &format!("{}/doc.html", base),
                &[("If-Modified-Since", "Fri, 01 Jan 2100 00:00:00 GMT")],
                None,
            )
            .await
            .unwrap();
        assert_eq!(status, 304);
        client.drain().await.unwrap();

        // Changed since the epoch: full response.
        let status = client
            .fetch(
                Method::Get,
                &format!("{}/doc.html", base),
                &[("If-Modified-Since", "Thu, 01 Jan 1970 00:00:00 GMT")],
                None,
            )
            .await
            .unwrap();
        assert_eq!(status, 200);
    });
}

#[test]
fn test_if_match_and_if_unmodified_since_412() {
    fiber::run(async {
        let root = DocRoot::new();
        root.write("doc.html", b"<p>hello</p>");
        let host = start_host(docs_config(&root)).await;
        let base = common::base_url(&host);

        let mut client = WebClient::new();
        let status = client
            .fetch(
                Method::Get,
                &format!("{}/doc.html", base),
                &[("If-Match", "\"0-0\"")],
                None,
            )
            .await
            .unwrap();
        assert_eq!(status, 412);
        client.drain().await.unwrap();

        // Wildcard matches any existing resource.
        let status = client
            .fetch(
                Method::Get,
                &format!("{}/doc.html", base),
                &[("If-Match", "*")],
                None,
            )
            .await
            .unwrap();
        assert_eq!(status, 200);
        client.drain().await.unwrap();

        let status = client
            .fetch(
                Method::Get,
                &format!("{}/doc.html", base),
                &[("If-Unmodified-Since", "Thu, 01 Jan 1970 00:00:00 GMT")],
                None,
            )
            .await
            .unwrap();
        assert_eq!(status, 412);
    });
}

#[test]
fn test_single_range() {
    fiber::run(async {
        let root = DocRoot::new();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        root.write("big.bin", &data);
        let host = start_host(docs_config(&root)).await;
        let base = common::base_url(&host);

        let mut client = WebClient::new();
        let status = client
            .fetch(
                Method::Get,
                &format!("{}/big.bin", base),
                &[("Range", "bytes=100-199")],
                None,
            )
            .await
            .unwrap();
        assert_eq!(status, 206);
        assert_eq!(client.header("Content-Range"), Some("bytes 100-199/10000"));
        assert_eq!(client.header("Content-Length"), Some("100"));
        assert_eq!(client.response().await.unwrap(), &data[100..200]);

        // Suffix form.
        let status = client
            .fetch(
                Method::Get,
                &format!("{}/big.bin", base),
                &[("Range", "bytes=-500")],
                None,
            )
            .await
            .unwrap();
        assert_eq!(status, 206);
        assert_eq!(client.header("Content-Range"), Some("bytes 9500-9999/10000"));
        assert_eq!(client.response().await.unwrap(), &data[9500..]);
    });
}

#[test]
fn test_multi_range_byteranges() {
    // S2: two ranges come back as multipart/byteranges with per-part
    // Content-Range headers.
    fiber::run(async {
        let root = DocRoot::new();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        root.write("big.bin", &data);
        let host = start_host(docs_config(&root)).await;
        let base = common::base_url(&host);

        let mut client = WebClient::new();
        let status = client
            .fetch(
                Method::Get,
                &format!("{}/big.bin", base),
                &[("Range", "bytes=0-0,9999-")],
                None,
            )
            .await
            .unwrap();
        assert_eq!(status, 206);
        let content_type = client.header("Content-Type").unwrap().to_string();
        assert!(
            content_type.starts_with("multipart/byteranges; boundary="),
            "content type: {}",
            content_type
        );
        let boundary = content_type.split('=').next_back().unwrap().to_string();

        let body = client.response().await.unwrap().to_vec();
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains(&format!("--{}", boundary)));
        assert!(text.contains("Content-Range: bytes 0-0/10000"));
        assert!(text.contains("Content-Range: bytes 9999-9999/10000"));
        assert!(text.ends_with(&format!("\r\n--{}--\r\n", boundary)));

        // Each part carries exactly one byte of the entity.
        assert!(body.contains(&data[0]));
        assert!(body.contains(&data[9999]));

        // The advertised length matched the payload.
        let advertised: usize = client.header("Content-Length").unwrap().parse().unwrap();
        assert_eq!(advertised, body.len());
    });
}

#[test]
fn test_unsatisfiable_range_416() {
    fiber::run(async {
        let root = DocRoot::new();
        root.write("small.bin", &[0u8; 100]);
        let host = start_host(docs_config(&root)).await;
        let base = common::base_url(&host);

        let mut client = WebClient::new();
        let status = client
            .fetch(
                Method::Get,
                &format!("{}/small.bin", base),
                &[("Range", "bytes=500-")],
                None,
            )
            .await
            .unwrap();
        assert_eq!(status, 416);
        assert_eq!(client.header("Content-Range"), Some("bytes */100"));
    });
}

#[test]
fn test_if_range_gates_ranges() {
    fiber::run(async {
        let root = DocRoot::new();
        let data = vec![7u8; 1000];
        root.write("big.bin", &data);
        let host = start_host(docs_config(&root)).await;
        let base = common::base_url(&host);
        let etag = root.etag("big.bin");

        let mut client = WebClient::new();
        // Current tag: the range applies.
        let status = client
            .fetch(
                Method::Get,
                &format!("{}/big.bin", base),
                &[("Range", "bytes=0-9"), ("If-Range", etag.as_str())],
                None,
            )
            .await
            .unwrap();
        assert_eq!(status, 206);
        client.drain().await.unwrap();

        // Stale tag: full entity instead.
        let status = client
            .fetch(
                Method::Get,
                &format!("{}/big.bin", base),
                &[("Range", "bytes=0-9"), ("If-Range", "\"0-0\"")],
                None,
            )
            .await
            .unwrap();
        assert_eq!(status, 200);
        assert_eq!(client.header("Content-Length"), Some("1000"));
    });
}

#[test]
fn test_precompressed_variant() {
    fiber::run(async {
        let root = DocRoot::new();
        root.write("app.js", b"console.log('source');");
        // Stand-in compressed bytes; selection is by suffix, not content.
        root.write("app.js.gz", b"GZDATA");
        let host = start_host(serde_json::json!({
            "listen": ["http://127.0.0.1:0"],
            "documents": root.path(),
            "routes": [{"match": "/", "handler": "file", "compressed": true}]
        }))
        .await;
        let base = common::base_url(&host);

        let mut client = WebClient::new();
        let status = client
            .fetch(
                Method::Get,
                &format!("{}/app.js", base),
                &[("Accept-Encoding", "gzip, deflate")],
                None,
            )
            .await
            .unwrap();
        assert_eq!(status, 200);
        assert_eq!(client.header("Content-Encoding"), Some("gzip"));
        // MIME reflects the logical resource; the tag reflects the
        // variant actually served.
        assert!(client.header("Content-Type").unwrap().contains("javascript"));
        assert_eq!(client.header("ETag"), Some(root.etag("app.js.gz").as_str()));
        assert_eq!(client.response().await.unwrap(), b"GZDATA");
        client.drain().await.unwrap();

        // No acceptable encoding: the original goes out.
        let status = client.get(&format!("{}/app.js", base)).await.unwrap();
        assert_eq!(status, 200);
        assert_eq!(client.header("Content-Encoding"), None);
        assert_eq!(client.response().await.unwrap(), b"console.log('source');");
    });
}

#[test]
fn test_cache_directives_restricted_to_extensions() {
    fiber::run(async {
        let root = DocRoot::new();
        root.write("app.js", b"js");
        root.write("doc.html", b"html");
        let host = start_host(serde_json::json!({
            "listen": ["http://127.0.0.1:0"],
            "documents": root.path(),
            "routes": [{
                "match": "/",
                "handler": "file",
                "cacheMaxAge": 3600,
                "extensions": ["js"]
            }]
        }))
        .await;
        let base = common::base_url(&host);

        let mut client = WebClient::new();
        client.get(&format!("{}/app.js", base)).await.unwrap();
        assert_eq!(client.header("Cache-Control"), Some("max-age=3600"));
        client.drain().await.unwrap();

        client.get(&format!("{}/doc.html", base)).await.unwrap();
        assert_eq!(client.header("Cache-Control"), None);
    });
}

#[test]
fn test_post_to_file_route_is_405() {
    fiber::run(async {
        let root = DocRoot::new();
        root.write("doc.html", b"x");
        let host = start_host(docs_config(&root)).await;
        let base = common::base_url(&host);

        let mut client = WebClient::new();
        let status = client
            .post(&format!("{}/doc.html", base), b"data")
            .await
            .unwrap();
        assert_eq!(status, 405);
        assert_eq!(client.header("Allow"), Some("GET, HEAD, OPTIONS"));
    });
}
