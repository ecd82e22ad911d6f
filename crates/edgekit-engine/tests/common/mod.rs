// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for edgekit-engine integration tests.
//!
//! Provides TestContext, which starts a full runtime on an ephemeral port
//! with the mock backend and an in-memory store, and connects a client.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use edgekit_engine::Engine;
use edgekit_engine::backend::MockBackend;
use edgekit_engine::runtime::{EngineRuntime, EngineRuntimeBuilder};
use edgekit_engine::store::MemoryStore;
use edgekit_protocol::client::EdgekitClient;
use edgekit_protocol::message::{
    AppKind, AppState, AppSummary, ErrorResponse, InstallRequest, Request, ServerMessage,
    StateChangedMessage, SuccessResponse,
};
use serde_json::json;

/// Test context that manages the runtime, its collaborators and a client.
pub struct TestContext {
    pub runtime: EngineRuntime,
    pub backend: Arc<MockBackend>,
    pub store: Arc<MemoryStore>,
    pub client: EdgekitClient,
}

impl TestContext {
    /// Runtime with default settings.
    pub async fn new() -> Self {
        Self::with(MockBackend::new(), MemoryStore::new(), |b| b).await
    }

    /// Runtime with the given collaborators and builder adjustments.
    pub async fn with(
        backend: MockBackend,
        store: MemoryStore,
        configure: impl FnOnce(EngineRuntimeBuilder) -> EngineRuntimeBuilder,
    ) -> Self {
        let backend = Arc::new(backend);
        let store = Arc::new(store);

        let builder = EngineRuntime::builder()
            .backend(backend.clone())
            .store(store.clone())
            .bind_addr("127.0.0.1:0".parse().unwrap());
        let runtime = configure(builder)
            .build()
            .expect("Failed to build runtime")
            .start()
            .await
            .expect("Failed to start runtime");

        let client = EdgekitClient::connect(&runtime.ws_url())
            .await
            .expect("Failed to connect client");

        Self {
            runtime,
            backend,
            store,
            client,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        self.runtime.engine()
    }

    /// Open another connection to the same runtime.
    pub async fn connect(&self) -> EdgekitClient {
        EdgekitClient::connect(&self.runtime.ws_url())
            .await
            .expect("Failed to connect client")
    }

    /// Send a request that must succeed.
    pub async fn ok(&mut self, request: Request) -> SuccessResponse {
        let kind = request.kind();
        match self.client.request(request).await.expect("transport error") {
            Ok(response) => response,
            Err(e) => panic!("{} failed: {:?} {}", kind, e.error_code, e.message),
        }
    }

    /// Send a request that must fail.
    pub async fn err(&mut self, request: Request) -> ErrorResponse {
        let kind = request.kind();
        match self.client.request(request).await.expect("transport error") {
            Ok(response) => panic!("{} unexpectedly succeeded: {:?}", kind, response),
            Err(e) => e,
        }
    }

    /// Install an application and return its canonical id.
    pub async fn install(&mut self, app_id: &str) -> String {
        let response = self.ok(install_request(app_id)).await;
        let summary: AppSummary = response.data_as().expect("install data");
        summary.app_id
    }

    /// Install and start, returning the execution id.
    pub async fn install_running(&mut self, app_id: &str) -> (String, String) {
        let app_id = self.install(app_id).await;
        let response = self.ok(Request::start(&app_id)).await;
        assert_eq!(response.state, Some(AppState::Running));
        let execution_id = response.data.as_ref().unwrap()["executionId"]
            .as_str()
            .unwrap()
            .to_string();
        (app_id, execution_id)
    }

    pub async fn status(&mut self, app_id: &str) -> AppSummary {
        self.ok(Request::get_status(app_id))
            .await
            .data_as()
            .expect("status data")
    }

    /// Poll the engine until `app_id` reaches `state`.
    pub async fn wait_for_state(&self, app_id: &str, state: AppState) {
        for _ in 0..200 {
            if self
                .engine()
                .status(app_id)
                .is_ok_and(|r| r.state == state)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "{} never reached {}, last seen {:?}",
            app_id,
            state,
            self.engine().status(app_id).map(|r| r.state)
        );
    }

    pub async fn shutdown(self) {
        let _ = self.client.close().await;
        self.runtime.shutdown().await.expect("Failed to shut down");
    }
}

pub fn install_request(app_id: &str) -> Request {
    Request::Install(InstallRequest::new(
        app_id,
        AppKind::Interpreted,
        json!({ "code": "print('hello')" }),
    ))
}

/// Next `state_changed` notification on `client`, skipping output.
pub async fn next_state_change(client: &mut EdgekitClient) -> StateChangedMessage {
    loop {
        match client.next_unsolicited().await.expect("notification") {
            ServerMessage::StateChanged(message) => return message,
            _ => continue,
        }
    }
}
