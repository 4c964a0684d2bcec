use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use deckify::auth::TokenProvider;
use deckify::error::PipelineError;
use deckify::graph::{GraphNotesSource, NotesSource};

struct StaticToken(&'static str);

#[async_trait::async_trait]
impl TokenProvider for StaticToken {
    async fn access_token(&self) -> Result<String, PipelineError> {
        Ok(self.0.to_string())
    }
}

fn spawn_graph_server() -> (String, mpsc::Sender<()>, thread::JoinHandle<()>) {
    let server = tiny_http::Server::http("127.0.0.1:0").expect("start tiny_http server");
    let addr = server.server_addr();
    let base_url = format!("http://{addr}");
    let base_for_links = base_url.clone();

    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

    let handle = thread::spawn(move || {
        loop {
            if shutdown_rx.try_recv().is_ok() {
                break;
            }

            let request = match server.recv_timeout(Duration::from_millis(50)) {
                Ok(Some(req)) => req,
                Ok(None) => continue,
                Err(_) => break,
            };

            let authorized = request.headers().iter().any(|h| {
                h.field.equiv("authorization") && h.value.as_str() == "Bearer good-token"
            });
            if !authorized {
                let _ = request
                    .respond(tiny_http::Response::from_string("unauthorized").with_status_code(401));
                continue;
            }

            let url = request.url().to_string();
            let path = url.split('?').next().unwrap_or(&url);
            let (status, body) = match path {
                "/me/onenote/sections/sec1/pages" => (
                    200,
                    format!(
                        r#"{{"value": [{{"id": "p1", "title": "First"}}],
                            "@odata.nextLink": "{base_for_links}/pages-batch-2"}}"#
                    ),
                ),
                "/pages-batch-2" => (
                    200,
                    r#"{"value": [{"id": "p2", "title": "Second", "lastModifiedDateTime": "2026-08-01T10:00:00Z"}]}"#
                        .to_string(),
                ),
                "/me/onenote/pages/p1/content" => {
                    (200, "<html><body><p>hello</p></body></html>".to_string())
                }
                _ => (404, "not found".to_string()),
            };
            let response = tiny_http::Response::from_string(body).with_status_code(status);
            let _ = request.respond(response);
        }
    });

    (base_url, shutdown_tx, handle)
}

fn source_with_token(base_url: &str, token: &'static str) -> GraphNotesSource {
    GraphNotesSource::new(reqwest::Client::new(), base_url, Arc::new(StaticToken(token)))
}

#[tokio::test(flavor = "multi_thread")]
async fn page_listing_follows_next_links() {
    let (base_url, shutdown, handle) = spawn_graph_server();
    let source = source_with_token(&base_url, "good-token");

    let pages = source.list_pages("sec1").await.unwrap();
    assert_eq!(pages.len(), 2);
    assert_eq!(pages[0].id, "p1");
    assert_eq!(pages[0].title, "First");
    assert_eq!(pages[1].id, "p2");
    assert!(pages[1].last_modified.is_some());

    let html = source.page_html("p1").await.unwrap();
    assert!(html.contains("<p>hello</p>"));

    let _ = shutdown.send(());
    let _ = handle.join();
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_token_surfaces_as_auth_required() {
    let (base_url, shutdown, handle) = spawn_graph_server();
    let source = source_with_token(&base_url, "bad-token");

    let err = source.list_pages("sec1").await.unwrap_err();
    assert!(matches!(err, PipelineError::AuthRequired { .. }));

    let _ = shutdown.send(());
    let _ = handle.join();
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_resource_is_a_fetch_error() {
    let (base_url, shutdown, handle) = spawn_graph_server();
    let source = source_with_token(&base_url, "good-token");

    let err = source.page_html("missing").await.unwrap_err();
    assert!(matches!(err, PipelineError::SourceFetch { .. }));

    let _ = shutdown.send(());
    let _ = handle.join();
}
