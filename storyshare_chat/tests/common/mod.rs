#![allow(dead_code)]

use chat_api::{UserId, UserSummary};
use std::net::{SocketAddr, TcpListener};
use storyshare_chat::{
    api::{build_router, AppState},
    auth,
    config::Config,
    users,
};
use tokio::task::JoinHandle;

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    pub handle: JoinHandle<()>,
    _tmp: tempfile::TempDir,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, token: &str) -> String {
        format!("ws://{}/ws?token={}", self.addr, token)
    }

    pub fn token(&self, user_id: UserId) -> String {
        auth::issue_jwt(&self.state.jwt_secret, user_id, time::Duration::hours(1)).unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub fn user(id: UserId, name: &str) -> UserSummary {
    UserSummary {
        id,
        username: name.to_lowercase(),
        name: name.into(),
        avatar_url: None,
    }
}

/// Start a server on an ephemeral port with alice (1), bob (2) and carol (3)
/// in the directory.
pub async fn spawn_server() -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();

    let tmp = tempfile::tempdir().unwrap();
    let mut config = Config::new(addr.to_string(), tmp.path());
    config.max_upload_mb = 1;
    config.seed_users = vec![user(1, "Alice"), user(2, "Bob"), user(3, "Carol")];
    let state = AppState::new(config).await.unwrap();
    let app = build_router(state.clone());
    let handle = tokio::spawn(async move {
        axum::Server::from_tcp(listener)
            .unwrap()
            .serve(app.into_make_service())
            .await
            .unwrap();
    });
    TestServer {
        addr,
        state,
        handle,
        _tmp: tmp,
    }
}

pub fn add_user(server: &TestServer, summary: &UserSummary) {
    let conn = server.state.pool.get().unwrap();
    users::upsert_user(&conn, summary).unwrap();
}
