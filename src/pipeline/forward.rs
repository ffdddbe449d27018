// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::{Endpoint, Msg, PipelineCtx};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ForwardError {
    #[error("service api return status code 4xx")]
    Backend4xx,
    #[error("service api return status code 5xx")]
    Backend5xx,
}

/// The JSON envelope exchanged with the backend in both directions.
///
/// On the reply side `msg_id == 0` means "no reply for the client".
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct BackendEnvelope {
    #[serde(rename = "sequenceID")]
    pub sequence_id: u32,
    #[serde(rename = "serverID")]
    pub server_id: String,
    #[serde(rename = "connID")]
    pub conn_id: String,
    #[serde(rename = "msgID")]
    pub msg_id: u16,
    #[serde(rename = "bytes")]
    pub bytes: String,
}

/// Terminal pipeline stage: one form-encoded POST to the backend per
/// message, with the optional reply frame pushed back onto the session.
pub(crate) fn forward_http(ctx: Arc<PipelineCtx>) -> Endpoint {
    Arc::new(move |agent, msg: Msg| {
        let ctx = ctx.clone();
        async move {
            let envelope = BackendEnvelope {
                sequence_id: agent.vars().next_sequence(),
                server_id: agent.sid().to_string(),
                conn_id: agent.cid().to_string(),
                msg_id: msg.id,
                bytes: BASE64.encode(&msg.body),
            };
            let envelope_json = serde_json::to_string(&envelope)?;
            let msg_id = msg.id.to_string();

            let resp = ctx
                .client
                .post(&ctx.service_api_url)
                .header("X-Real-IP", agent.address())
                .header("This-Is-Secret", agent.address())
                .form(&[
                    ("proto_type", "stream"),
                    ("msg_id", msg_id.as_str()),
                    ("msg", envelope_json.as_str()),
                ])
                .send()
                .await?;

            let status = resp.status();
            let body = resp.bytes().await?;

            if !status.is_success() {
                if status.is_server_error() {
                    return Err(ForwardError::Backend5xx.into());
                }
                if status.is_client_error() {
                    return Err(ForwardError::Backend4xx.into());
                }
                return Ok(());
            }

            // A reply that does not parse as an envelope means "no reply".
            let Ok(reply) = serde_json::from_slice::<BackendEnvelope>(&body) else {
                return Ok(());
            };
            if reply.msg_id == 0 {
                return Ok(());
            }

            let reply_body = BASE64.decode(reply.bytes.as_bytes()).unwrap_or_default();
            agent.write(reply.msg_id, &reply_body).await?;

            Ok(())
        }
        .boxed()
    })
}
