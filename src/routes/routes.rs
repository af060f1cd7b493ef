//! HTTP routes.
//!
//! ## Structure
//! - **Health**
//!   - `GET    /healthz`, `GET /readyz`
//!
//! - **Files** (caller identified by `x-owner-id`)
//!   - `POST   /files?mode=sync|staged` - multipart upload
//!   - `GET    /files`                  - live files with retrieval links
//!   - `GET    /files/deleted`          - soft-deleted files
//!   - `GET    /files/{id}/link`        - cached retrieval link
//!   - `PATCH  /files/{id}`             - rename
//!   - `DELETE /files/{id}`             - soft delete
//!   - `POST   /files/{id}/share`       - mint a share link
//!
//! - **Public**
//!   - `GET    /share/{token}`          - download through a share link
//!
//! - **Events**
//!   - `GET    /events`                 - server-sent notifications

use crate::{
    handlers::{
        event_handlers::events,
        file_handlers::{
            delete_file, file_link, list_deleted, list_files, rename_file, upload_files,
        },
        health_handlers::{healthz, readyz},
        share_handlers::{create_share, serve_share},
    },
    services::state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, patch, post},
};

/// Largest accepted upload request body.
const MAX_UPLOAD_BYTES: usize = 5 * 1024 * 1024 * 1024;

pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // files
        .route(
            "/files",
            post(upload_files)
                .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
                .get(list_files),
        )
        .route("/files/deleted", get(list_deleted))
        .route("/files/{id}", patch(rename_file).delete(delete_file))
        .route("/files/{id}/link", get(file_link))
        .route("/files/{id}/share", post(create_share))
        // public + events
        .route("/share/{token}", get(serve_share))
        .route("/events", get(events))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        handlers::{
            OWNER_HEADER,
            file_handlers::{FileView, StagedResponse, UploadResponse},
            share_handlers::ShareResponse,
        },
        models::link::SharedLink,
        services::{
            cache::TransferDescriptor,
            object_store::memory::{Call, MemoryStore},
            state::tests::test_state,
        },
    };
    use axum::{
        body::Body,
        http::{Method, Request, StatusCode, header},
        response::Response,
    };
    use chrono::{TimeDelta, Utc};
    use http_body_util::BodyExt;
    use serde::de::DeserializeOwned;
    use std::{sync::Arc, time::Duration};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };
    use tower::ServiceExt;
    use uuid::Uuid;

    const BOUNDARY: &str = "filedrop-test-boundary";

    struct Harness {
        app: Router,
        state: AppState,
        store: Arc<MemoryStore>,
        owner: Uuid,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        async fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let (state, store) = test_state(dir.path()).await;
            Self {
                app: routes().with_state(state.clone()),
                state,
                store,
                owner: Uuid::new_v4(),
                _dir: dir,
            }
        }

        async fn send(&self, request: Request<Body>) -> Response {
            self.app.clone().oneshot(request).await.unwrap()
        }

        fn request(&self, method: Method, uri: &str) -> axum::http::request::Builder {
            Request::builder()
                .method(method)
                .uri(uri)
                .header(OWNER_HEADER, self.owner.to_string())
        }

        async fn upload(&self, mode: &str, files: &[(&str, &str)]) -> Response {
            let request = self
                .request(Method::POST, &format!("/files?mode={mode}"))
                .header(
                    header::CONTENT_TYPE,
                    format!("multipart/form-data; boundary={BOUNDARY}"),
                )
                .body(Body::from(multipart_body(files)))
                .unwrap();
            self.send(request).await
        }

        async fn get(&self, uri: &str) -> Response {
            self.send(self.request(Method::GET, uri).body(Body::empty()).unwrap())
                .await
        }

        async fn only_file(&self) -> FileView {
            let mut files: Vec<FileView> = json(self.get("/files").await).await;
            assert_eq!(files.len(), 1);
            files.remove(0)
        }
    }

    fn multipart_body(files: &[(&str, &str)]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, bytes) in files {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"files\"; filename=\"{name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(bytes.as_bytes());
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    async fn bytes(response: Response) -> Vec<u8> {
        response
            .into_body()
            .collect()
            .await
            .unwrap()
            .to_bytes()
            .to_vec()
    }

    async fn json<T: DeserializeOwned>(response: Response) -> T {
        serde_json::from_slice(&bytes(response).await).unwrap()
    }

    fn presigns(store: &MemoryStore) -> usize {
        store.count(|call| matches!(call, Call::Presign { .. }))
    }

    #[tokio::test]
    async fn healthz_and_readyz_are_ok() {
        let h = Harness::new().await;
        assert_eq!(h.get("/healthz").await.status(), StatusCode::OK);
        assert_eq!(h.get("/readyz").await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn requests_without_owner_are_unauthorized() {
        let h = Harness::new().await;
        let request = Request::get("/files").body(Body::empty()).unwrap();
        assert_eq!(h.send(request).await.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn sync_upload_stores_encrypted_objects_and_lists_them() {
        let h = Harness::new().await;

        let response = h
            .upload("sync", &[("a.txt", "alpha"), ("b.bin", "bravo")])
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let uploaded: UploadResponse = json(response).await;
        let mut names = uploaded.uploaded.clone();
        names.sort();
        assert_eq!(names, vec!["a.txt", "b.bin"]);
        assert!(uploaded.failed.is_empty());

        let files: Vec<FileView> = json(h.get("/files").await).await;
        assert_eq!(files.len(), 2);
        let a = files.iter().find(|f| f.file_name == "a.txt").unwrap();
        let key = format!("{}.txt", a.id);
        let stored = h.store.object(&key).unwrap();
        assert_ne!(&stored[..], b"alpha".as_slice());
        assert_eq!(h.state.engine.download(&key).await.unwrap(), b"alpha");
    }

    #[tokio::test]
    async fn failed_sync_upload_drops_its_record() {
        let h = Harness::new().await;
        h.store.fail_all();

        let response = h.upload("sync", &[("doomed.txt", "lost")]).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let live: Vec<FileView> = json(h.get("/files").await).await;
        assert!(live.is_empty());
        let mut leftovers = tokio::fs::read_dir(h.state.staging.dir()).await.unwrap();
        assert!(leftovers.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upload_without_files_is_a_bad_request() {
        let h = Harness::new().await;
        assert_eq!(h.upload("sync", &[]).await.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn link_is_cached_until_rename() {
        let h = Harness::new().await;
        h.upload("sync", &[("old.pdf", "%PDF")]).await;
        let file = h.only_file().await;
        assert_eq!(presigns(&h.store), 1);

        let link: TransferDescriptor = json(h.get(&format!("/files/{}/link", file.id)).await).await;
        assert_eq!(link.file_name, "old.pdf");
        assert_eq!(presigns(&h.store), 1);

        let rename = h
            .request(Method::PATCH, &format!("/files/{}", file.id))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"file_name":"new.pdf"}"#))
            .unwrap();
        assert_eq!(h.send(rename).await.status(), StatusCode::OK);

        let link: TransferDescriptor = json(h.get(&format!("/files/{}/link", file.id)).await).await;
        assert_eq!(link.file_name, "new.pdf");
        assert_eq!(presigns(&h.store), 2);
    }

    #[tokio::test]
    async fn other_users_cannot_rename() {
        let h = Harness::new().await;
        h.upload("sync", &[("mine.txt", "x")]).await;
        let file = h.only_file().await;

        let request = Request::builder()
            .method(Method::PATCH)
            .uri(format!("/files/{}", file.id))
            .header(OWNER_HEADER, Uuid::new_v4().to_string())
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"file_name":"stolen.txt"}"#))
            .unwrap();
        assert_eq!(h.send(request).await.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn delete_moves_file_to_deleted_listing() {
        let h = Harness::new().await;
        h.upload("sync", &[("bye.txt", "x")]).await;
        let file = h.only_file().await;

        let delete = h
            .request(Method::DELETE, &format!("/files/{}", file.id))
            .body(Body::empty())
            .unwrap();
        assert_eq!(h.send(delete).await.status(), StatusCode::NO_CONTENT);

        let live: Vec<FileView> = json(h.get("/files").await).await;
        assert!(live.is_empty());
        let deleted: Vec<serde_json::Value> = json(h.get("/files/deleted").await).await;
        assert_eq!(deleted.len(), 1);
        assert_eq!(
            h.get(&format!("/files/{}/link", file.id)).await.status(),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn share_link_downloads_decrypted_attachment() {
        let h = Harness::new().await;
        h.upload("sync", &[("report.pdf", "quarterly numbers")]).await;
        let file = h.only_file().await;

        let response = h
            .send(
                h.request(Method::POST, &format!("/files/{}/share", file.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let share: ShareResponse = json(response).await;
        let path = share.url.strip_prefix("https://files.test").unwrap();
        assert!(path.starts_with("/share/"));

        let download = h
            .send(Request::get(path).body(Body::empty()).unwrap())
            .await;
        assert_eq!(download.status(), StatusCode::OK);
        assert_eq!(
            download.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"report.pdf\""
        );
        assert_eq!(bytes(download).await, b"quarterly numbers");
    }

    #[tokio::test]
    async fn unknown_and_expired_share_tokens() {
        let h = Harness::new().await;
        assert_eq!(
            h.send(Request::get("/share/nope").body(Body::empty()).unwrap())
                .await
                .status(),
            StatusCode::NOT_FOUND
        );

        h.upload("sync", &[("old.txt", "x")]).await;
        let file = h.only_file().await;
        h.state
            .metadata
            .create_link(&SharedLink {
                share_token: "expired".into(),
                file_id: file.id,
                object_key: format!("{}.txt", file.id),
                file_name: file.file_name,
                expires_at: Utc::now() - TimeDelta::minutes(1),
            })
            .await
            .unwrap();
        assert_eq!(
            h.send(Request::get("/share/expired").body(Body::empty()).unwrap())
                .await
                .status(),
            StatusCode::GONE
        );
    }

    #[tokio::test]
    async fn staged_upload_is_accepted_then_finished_in_background() {
        let h = Harness::new().await;
        let mut events = h.state.notifications.subscribe();

        let response = h.upload("staged", &[("later.txt", "deferred")]).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let accepted: StagedResponse = json(response).await;
        assert_eq!(accepted.files, vec!["later.txt"]);

        h.state.staging.shutdown().await;

        let note = events.recv().await.unwrap();
        assert_eq!(note.owner_id, h.owner);
        let file = h.only_file().await;
        assert_eq!(
            h.state
                .engine
                .download(&format!("{}.txt", file.id))
                .await
                .unwrap(),
            b"deferred"
        );
        let mut leftovers = tokio::fs::read_dir(h.state.staging.dir()).await.unwrap();
        assert!(leftovers.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_staged_upload_is_listed_without_a_link() {
        let h = Harness::new().await;
        h.store.fail_all();

        let response = h.upload("staged", &[("broken.txt", "never arrives")]).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        h.state.staging.shutdown().await;

        let file = h.only_file().await;
        assert!(file.upload_failed_at.is_some());
        assert!(file.url.is_none());
        assert_eq!(presigns(&h.store), 0);

        let link = h.get(&format!("/files/{}/link", file.id)).await;
        assert_eq!(link.status(), StatusCode::CONFLICT);
        let share = h
            .send(
                h.request(Method::POST, &format!("/files/{}/share", file.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(share.status(), StatusCode::CONFLICT);

        let mut leftovers = tokio::fs::read_dir(h.state.staging.dir()).await.unwrap();
        assert!(leftovers.next_entry().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn graceful_shutdown_finishes_with_an_open_event_stream() {
        let h = Harness::new().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let signal = h.state.shutdown.clone();
        let server = tokio::spawn(
            axum::serve(listener, h.app.clone())
                .with_graceful_shutdown(signal.cancelled_owned())
                .into_future(),
        );

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(
                format!(
                    "GET /events HTTP/1.1\r\nHost: localhost\r\n{OWNER_HEADER}: {}\r\n\r\n",
                    h.owner
                )
                .as_bytes(),
            )
            .await
            .unwrap();
        let mut head = Vec::new();
        let mut buf = [0u8; 1024];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            let read = client.read(&mut buf).await.unwrap();
            assert!(read > 0, "connection closed before headers");
            head.extend_from_slice(&buf[..read]);
        }
        assert!(head.starts_with(b"HTTP/1.1 200 OK"));

        h.state.shutdown.cancel();

        let finished = tokio::time::timeout(Duration::from_secs(3), server).await;
        assert!(finished.is_ok(), "server still running after shutdown");
        drop(client);
    }
}
