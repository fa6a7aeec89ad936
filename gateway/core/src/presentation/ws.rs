// Copyright (c) 2026 Relay Gateway Contributors
// SPDX-License-Identifier: AGPL-3.0
//! WebSocket upgrade for `/ws`.
//!
//! Admission (read scope, connection cap) happens before the upgrade so a
//! refused client never costs a socket. The accepted connection is handed to
//! [`RealtimeSession`] together with the permit, which lives as long as the
//! session does.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{RawQuery, State};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use futures::stream::SplitSink;
use futures::{future, SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::application::auth_gate::query_param;
use crate::application::realtime::{OutboundSink, RealtimeSession, SinkClosed};
use crate::domain::auth_context::AuthorizationContext;
use crate::domain::realtime::PollSettings;
use crate::domain::scope::Scope;
use crate::presentation::error::RelayError;
use crate::presentation::http::{RelayState, RequestId};

const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Writer half of an accepted socket. The mutex keeps frames from the
/// command loop and the audit pump from interleaving.
struct SocketSink {
    writer: Mutex<SplitSink<WebSocket, Message>>,
}

#[async_trait]
impl OutboundSink for SocketSink {
    async fn send(&self, message: Value) -> Result<(), SinkClosed> {
        let text = serde_json::to_string(&message).map_err(|_| SinkClosed)?;
        let mut writer = self.writer.lock().await;
        match tokio::time::timeout(WRITE_TIMEOUT, writer.send(Message::Text(text.into()))).await {
            Ok(Ok(())) => Ok(()),
            _ => Err(SinkClosed),
        }
    }
}

pub(crate) async fn realtime_upgrade(
    State(relay): State<Arc<RelayState>>,
    Extension(caller): Extension<AuthorizationContext>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    RawQuery(query): RawQuery,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if !caller.has_scope(Scope::Read) {
        warn!(request_id = %request_id, subject = %caller.subject, "Realtime connection requires read scope");
        return RelayError::Forbidden.with_request_id(request_id).into_response();
    }

    let Some(permit) = relay.connections.try_acquire() else {
        relay.metrics.ws_rejected.increment(1);
        warn!(
            request_id = %request_id,
            max = relay.connections.max(),
            "Realtime connection limit reached"
        );
        return RelayError::TooManyConnections
            .with_request_id(request_id)
            .into_response();
    };

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            debug!(request_id = %request_id, reason = %rejection, "Invalid websocket upgrade");
            return rejection.into_response();
        }
    };

    let since_id = query_param(query.as_deref(), "since_id")
        .and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or(0)
        .max(0);
    let poll = PollSettings::from_query(
        query_param(query.as_deref(), "poll_timeout").as_deref(),
        query_param(query.as_deref(), "poll_interval").as_deref(),
    );
    let session = Arc::new(RealtimeSession::new(
        caller,
        relay.policy,
        Arc::clone(&relay.upstream),
        relay.metrics.upstream_errors.clone(),
        request_id,
        since_id,
        poll,
    ));

    upgrade.on_upgrade(move |socket| async move {
        let _permit = permit;
        let (writer, reader) = socket.split();
        let sink: Arc<dyn OutboundSink> = Arc::new(SocketSink {
            writer: Mutex::new(writer),
        });
        let incoming = Box::pin(
            reader
                .take_while(|frame| future::ready(matches!(frame, Ok(msg) if !matches!(msg, Message::Close(_)))))
                .filter_map(|frame| {
                    future::ready(match frame {
                        Ok(Message::Text(text)) => Some(text.as_str().to_owned()),
                        Ok(Message::Binary(bytes)) => String::from_utf8(bytes.to_vec()).ok(),
                        _ => None,
                    })
                }),
        );
        session.serve(sink, incoming).await;
    })
}
