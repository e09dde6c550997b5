// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! WebSocket session behaviour, driven without a socket.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::*;
use ipcsim_core::ProcessState;
use ipcsim_server::{Connections, ServerMessage, Status, TokenAuthority};

fn mensaje(message: &ServerMessage) -> Option<&str> {
    match message {
        ServerMessage::AuthResponse { mensaje, .. }
        | ServerMessage::AccionRespuesta { mensaje, .. } => mensaje.as_deref(),
        ServerMessage::InterrupcionRespuesta { mensaje, .. } | ServerMessage::Error { mensaje } => {
            Some(mensaje.as_str())
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_actions_require_authentication() {
    let dispatcher = dispatcher(Duration::from_millis(500));
    let connections = Arc::new(Connections::new(10));
    let (mut session, mut rx) = session(&dispatcher, &connections, 100);

    session.handle_text(&accion("consulta", "analysis")).await;
    let reply = rx.recv().await.unwrap();
    assert_eq!(reply, ServerMessage::accion_error("No autenticado"));

    session
        .handle_text(&frame("interrumpir", json!({"processId": "p-1"})))
        .await;
    let reply = rx.recv().await.unwrap();
    assert_eq!(
        reply,
        ServerMessage::interrupcion(Status::Error, "No autenticado")
    );
    assert!(dispatcher.registry().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_auth_success_returns_permissions() {
    let dispatcher = dispatcher(Duration::from_millis(500));
    let connections = Arc::new(Connections::new(10));
    let (mut session, mut rx) = session(&dispatcher, &connections, 100);

    session
        .handle_text(&frame("auth", json!({"role": "operator", "token": token("operator")})))
        .await;
    let ServerMessage::AuthResponse {
        status,
        permissions,
        mensaje,
    } = rx.recv().await.unwrap()
    else {
        panic!("expected auth_response");
    };
    assert_eq!(status, Status::Success);
    assert_eq!(permissions.unwrap().max_concurrent_processes, 5);
    assert!(mensaje.is_none());
    assert_eq!(session.identity().unwrap().role, "operator");
    assert_eq!(connections.by_role().get("operator"), Some(&1));
}

#[tokio::test(start_paused = true)]
async fn test_auth_failures() {
    let dispatcher = dispatcher(Duration::from_millis(500));
    let connections = Arc::new(Connections::new(10));
    let (mut session, mut rx) = session(&dispatcher, &connections, 100);

    session
        .handle_text(&frame("auth", json!({"role": "admin", "token": token("viewer")})))
        .await;
    let reply = rx.recv().await.unwrap();
    assert_eq!(mensaje(&reply), Some("El rol no coincide con el token"));

    let forged = TokenAuthority::new("other").issue("admin", "x", None).unwrap();
    session
        .handle_text(&frame("auth", json!({"role": "admin", "token": forged})))
        .await;
    let reply = rx.recv().await.unwrap();
    assert_eq!(mensaje(&reply), Some("Token inválido o expirado"));

    session
        .handle_text(&frame("auth", json!({"role": "root", "token": token("root")})))
        .await;
    let reply = rx.recv().await.unwrap();
    assert_eq!(mensaje(&reply), Some("Rol no válido"));

    assert!(session.identity().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_viewer_calculation_is_denied() {
    let dispatcher = dispatcher(Duration::from_millis(500));
    let connections = Arc::new(Connections::new(10));
    let (mut session, mut rx) = session(&dispatcher, &connections, 100);
    login(&mut session, &mut rx, "viewer").await;

    session.handle_text(&accion("consulta", "calculation")).await;
    let reply = rx.recv().await.unwrap();
    assert_eq!(reply, ServerMessage::accion_error("Permiso denegado"));
    assert!(dispatcher.registry().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_accion_is_answered_when_the_process_ends() {
    let dispatcher = dispatcher(Duration::from_millis(500));
    let connections = Arc::new(Connections::new(10));
    let (mut session, mut rx) = session(&dispatcher, &connections, 100);
    login(&mut session, &mut rx, "admin").await;

    session.handle_text(&accion("solicitud", "database")).await;
    assert!(rx.try_recv().is_err());

    let ServerMessage::AccionRespuesta {
        status,
        process_id,
        resultado,
        ..
    } = rx.recv().await.unwrap()
    else {
        panic!("expected accion_respuesta");
    };
    assert_eq!(status, Status::Success);
    let process_id = process_id.unwrap();
    assert_eq!(resultado.unwrap()["result"], json!({"n": 1}));

    let process = dispatcher.registry().get(&process_id).unwrap();
    assert_eq!(process.state, ProcessState::Completed);
    assert_eq!(process.owner, session.owner());
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit() {
    let dispatcher = dispatcher(Duration::from_millis(500));
    let connections = Arc::new(Connections::new(10));
    let (mut session, mut rx) = session(&dispatcher, &connections, 2);
    login(&mut session, &mut rx, "admin").await;

    session.handle_text(&accion("solicitud", "database")).await;
    session.handle_text(&accion("solicitud", "database")).await;
    session.handle_text(&accion("solicitud", "database")).await;

    let reply = rx.recv().await.unwrap();
    assert_eq!(reply, ServerMessage::accion_error("Rate limit excedido"));
    assert_eq!(dispatcher.registry().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_interrupt_permissions() {
    let dispatcher = dispatcher(Duration::from_secs(10));
    let connections = Arc::new(Connections::new(10));
    let (mut owner, mut owner_rx) = session(&dispatcher, &connections, 100);
    let (mut other, mut other_rx) = session(&dispatcher, &connections, 100);
    let (mut admin, mut admin_rx) = session(&dispatcher, &connections, 100);
    login(&mut owner, &mut owner_rx, "operator").await;
    login(&mut other, &mut other_rx, "operator").await;
    login(&mut admin, &mut admin_rx, "admin").await;

    owner.handle_text(&accion("solicitud", "database")).await;
    let process_id = dispatcher.registry().active_ids_for(owner.owner())[0].clone();
    let interrupt = frame("interrumpir", json!({"processId": process_id}));

    other.handle_text(&interrupt).await;
    assert_eq!(
        other_rx.recv().await.unwrap(),
        ServerMessage::interrupcion(
            Status::Error,
            "No tienes permiso para interrumpir este proceso"
        )
    );

    admin.handle_text(&interrupt).await;
    assert_eq!(
        admin_rx.recv().await.unwrap(),
        ServerMessage::interrupcion(Status::Success, "Proceso interrumpido correctamente")
    );

    let reply = owner_rx.recv().await.unwrap();
    assert_eq!(mensaje(&reply), Some("Proceso interrumpido"));
    assert_eq!(
        dispatcher.registry().get(&process_id).unwrap().state,
        ProcessState::Interrupted
    );

    admin.handle_text(&interrupt).await;
    assert_eq!(
        admin_rx.recv().await.unwrap(),
        ServerMessage::interrupcion(Status::Error, "Proceso no encontrado")
    );
}

#[tokio::test(start_paused = true)]
async fn test_close_releases_owner() {
    let dispatcher = dispatcher(Duration::from_secs(10));
    let connections = Arc::new(Connections::new(10));
    let (mut session, mut rx) = session(&dispatcher, &connections, 100);
    login(&mut session, &mut rx, "viewer").await;

    for _ in 0..3 {
        session.handle_text(&accion("consulta", "analysis")).await;
    }
    let owner = session.owner().to_string();
    assert_eq!(dispatcher.registry().active_count_for(&owner), 2);
    assert_eq!(dispatcher.queued_len().await, 1);

    let summary = session.close().await;
    assert_eq!(summary.interrupted, 2);
    assert_eq!(summary.dropped, 1);
    assert!(connections.is_empty());

    let mut replies = Vec::new();
    for _ in 0..3 {
        replies.push(rx.recv().await.unwrap());
    }
    assert!(replies.iter().all(|r| matches!(
        r,
        ServerMessage::AccionRespuesta {
            status: Status::Error,
            ..
        }
    )));
    assert_eq!(dispatcher.registry().active_count_for(&owner), 0);
    assert_eq!(dispatcher.queued_len().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_undecodable_frames() {
    let dispatcher = dispatcher(Duration::from_millis(500));
    let connections = Arc::new(Connections::new(10));
    let (mut session, mut rx) = session(&dispatcher, &connections, 100);

    session.handle_text("{oops").await;
    assert!(matches!(rx.recv().await.unwrap(), ServerMessage::Error { .. }));

    session.handle_text(&frame("borrar", json!({}))).await;
    assert_eq!(
        rx.recv().await.unwrap(),
        ServerMessage::Error {
            mensaje: "Evento desconocido: borrar".to_string()
        }
    );
}
