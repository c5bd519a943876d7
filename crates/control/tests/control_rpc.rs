//! End-to-end tests for the control RPC surface.

mod common;

use common::{StreamingHub, TestServer, authed};
use tonic::{Code, Request};
use trellis_proto::{
    AddLabelLinkRequest, Capability, ConfigRequest, CreateTokenRequest, HubDisconnectRequest,
    HubFrame, LabelSet, NetworkLocation, Noop, RegisterRequest, ServiceRequest,
    ServiceTokenRequest, TokenCapability, TokenRole, id_bytes,
};
use uuid::Uuid;

fn account(ns: &str) -> (Uuid, trellis_proto::Account) {
    let id = Uuid::new_v4();
    (id, trellis_proto::Account::new(id, ns))
}

fn locations() -> Vec<NetworkLocation> {
    vec![NetworkLocation {
        addresses: vec!["10.1.2.3:443".to_string()],
        name: "public".to_string(),
    }]
}

#[tokio::test]
async fn register_then_create_token() {
    let server = TestServer::spawn().await;
    let manage = server.manage_token("/org/team").await;

    let token = trellis_token::verify(&manage, &server.public_key).unwrap();
    assert_eq!(token.role(), TokenRole::Manage);
    assert_eq!(token.namespace(), "/org/team");
    assert_eq!(token.capability(Capability::Access), Some("/org/team"));

    // A delegate scoped below the caller's namespace is allowed.
    let mut client = server.client().await;
    let (_, sub_account) = account("/org/team/sub");
    let delegate = client
        .create_token(authed(
            CreateTokenRequest {
                account: Some(sub_account),
                capabilities: vec![TokenCapability {
                    capability: Capability::Access as i32,
                    value: "/org/team/sub".to_string(),
                }],
                valid_duration_secs: 0,
            },
            &manage,
        ))
        .await
        .unwrap()
        .into_inner()
        .token;

    let delegate = trellis_token::verify(&delegate, &server.public_key).unwrap();
    assert_eq!(delegate.role(), TokenRole::Manage);
    assert_eq!(delegate.namespace(), "/org/team/sub");
    assert_eq!(delegate.capability(Capability::Access), Some("/org/team/sub"));

    // An ACCESS grant outside the caller's namespace is rejected.
    let (_, foreign) = account("/org/team/sub");
    let err = client
        .create_token(authed(
            CreateTokenRequest {
                account: Some(foreign),
                capabilities: vec![TokenCapability {
                    capability: Capability::Access as i32,
                    value: "/other/team".to_string(),
                }],
                valid_duration_secs: 0,
            },
            &manage,
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn register_requires_shared_token() {
    let server = TestServer::spawn().await;
    let mut client = server.client().await;

    let err = client
        .register(authed(
            RegisterRequest {
                namespace: "/org".to_string(),
            },
            "wrong-token",
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);

    let err = client
        .register(Request::new(RegisterRequest {
            namespace: "/org".to_string(),
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);
}

#[tokio::test]
async fn register_rejects_prefixed_namespace() {
    let server = TestServer::spawn().await;
    let _ = server.manage_token("/org/team").await;

    let mut client = server.client().await;
    let err = client
        .register(authed(
            RegisterRequest {
                namespace: "/org".to_string(),
            },
            &server.register_token,
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn rpcs_reject_missing_malformed_and_wrong_role_bearers() {
    let server = TestServer::spawn().await;
    let mut client = server.client().await;

    let config_request = || ConfigRequest {
        stable_id: id_bytes(Uuid::new_v4()),
        instance_id: id_bytes(Uuid::new_v4()),
        locations: locations(),
    };

    // Missing bearer.
    let err = client
        .fetch_config(Request::new(config_request()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);

    // Malformed bearer.
    let err = client
        .fetch_config(authed(config_request(), "garbage"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);

    // Wrong role: a MANAGE token cannot call hub RPCs.
    let manage = server.manage_token("/org").await;
    let err = client
        .fetch_config(authed(config_request(), &manage))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);

    // Wrong role the other way: a HUB token cannot manage label links.
    let hub = server.hub_token().await;
    let (_, acc) = account("/org");
    let err = client
        .add_label_link(
            authed(
                AddLabelLinkRequest {
                    account: Some(acc),
                    labels: Some(LabelSet::from_strings(&["host=a"]).unwrap()),
                    target: Some(LabelSet::from_strings(&["env=prod"]).unwrap()),
                },
                &hub,
            ),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);
}

#[tokio::test]
async fn hub_lifecycle() {
    let server = TestServer::spawn().await;
    let hub_token = server.hub_token().await;
    let mut client = server.client().await;

    let stable = Uuid::new_v4();
    let instance1 = Uuid::new_v4();

    let config = client
        .fetch_config(authed(
            ConfigRequest {
                stable_id: id_bytes(stable),
                instance_id: id_bytes(instance1),
                locations: locations(),
            },
            &hub_token,
        ))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(config.token_pub, server.public_key.to_vec());
    assert_eq!(config.s3_bucket, "test-bucket");

    // A streaming hub sees the new service.
    let mut session = StreamingHub::open(&server, &hub_token).await;

    let (account_id, acc) = account("/org/team");
    let service_id = Uuid::new_v4();
    client
        .add_service(authed(
            ServiceRequest {
                account: Some(acc.clone()),
                hub: id_bytes(instance1),
                id: id_bytes(service_id),
                r#type: "http".to_string(),
                labels: Some(LabelSet::from_strings(&["env=prod"]).unwrap()),
            },
            &hub_token,
        ))
        .await
        .unwrap();

    let delta = session.next_delta().await;
    assert_eq!(delta.account_services.len(), 1);
    let services = &delta.account_services[0];
    assert_eq!(services.account.as_ref().unwrap().key().unwrap(), account_id);
    assert_eq!(services.services.len(), 1);
    let route = &services.services[0];
    assert_eq!(route.hub, id_bytes(instance1));
    assert_eq!(route.id, id_bytes(service_id));
    assert_eq!(route.r#type, "http");
    assert_eq!(
        route.labels.as_ref().unwrap().to_core().unwrap().flatten(),
        "env=prod"
    );

    // Rotating the instance removes every service of the prior one.
    let instance2 = Uuid::new_v4();
    client
        .fetch_config(authed(
            ConfigRequest {
                stable_id: id_bytes(stable),
                instance_id: id_bytes(instance2),
                locations: locations(),
            },
            &hub_token,
        ))
        .await
        .unwrap();
    assert_eq!(server.store.service_count(), 0);

    // AllHubs reflects the rotated instance.
    let hubs = client
        .all_hubs(Request::new(Noop {}))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(hubs.hubs.len(), 1);
    assert_eq!(hubs.hubs[0].id, id_bytes(instance2));
    assert_eq!(hubs.hubs[0].locations, locations());
}

#[tokio::test]
async fn label_link_broadcast_reaches_every_hub() {
    let server = TestServer::spawn().await;
    let hub_token = server.hub_token().await;

    let mut hub1 = StreamingHub::open(&server, &hub_token).await;
    let mut hub2 = StreamingHub::open(&server, &hub_token).await;

    let manage = server.manage_token("/org/team").await;
    let (_, acc) = account("/org/team");
    let mut client = server.client().await;
    client
        .add_label_link(authed(
            AddLabelLinkRequest {
                account: Some(acc.clone()),
                labels: Some(LabelSet::from_strings(&["host=foo.example"]).unwrap()),
                target: Some(LabelSet::from_strings(&["env=prod"]).unwrap()),
            },
            &manage,
        ))
        .await
        .unwrap();

    for hub in [&mut hub1, &mut hub2] {
        let delta = hub.next_delta().await;
        let links = delta.new_label_links.unwrap();
        assert_eq!(links.label_links.len(), 1);
        let link = &links.label_links[0];
        assert_eq!(link.account.as_ref().unwrap().key().unwrap(), acc.key().unwrap());
        assert_eq!(
            link.labels.as_ref().unwrap().to_core().unwrap().flatten(),
            "host=foo.example"
        );
        assert_eq!(
            link.target.as_ref().unwrap().to_core().unwrap().flatten(),
            "env=prod"
        );
    }
}

#[tokio::test]
async fn label_link_rejects_foreign_namespace() {
    let server = TestServer::spawn().await;
    let manage = server.manage_token("/org/team").await;
    let (_, acc) = account("/other/team");

    let mut client = server.client().await;
    let err = client
        .add_label_link(authed(
            AddLabelLinkRequest {
                account: Some(acc),
                labels: Some(LabelSet::from_strings(&["host=a"]).unwrap()),
                target: Some(LabelSet::from_strings(&["env=prod"]).unwrap()),
            },
            &manage,
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn hub_disconnect_accumulates_failures() {
    let server = TestServer::spawn().await;
    let hub_token = server.hub_token().await;
    let mut client = server.client().await;

    let stable = Uuid::new_v4();
    let instance = Uuid::new_v4();
    client
        .fetch_config(authed(
            ConfigRequest {
                stable_id: id_bytes(stable),
                instance_id: id_bytes(instance),
                locations: locations(),
            },
            &hub_token,
        ))
        .await
        .unwrap();

    // Service deletion fails, hub-row deletion still runs.
    server.store.fail_next("remove_hub_services");
    let err = client
        .hub_disconnect(authed(
            HubDisconnectRequest {
                stable_id: id_bytes(stable),
                instance_id: id_bytes(instance),
            },
            &hub_token,
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Internal);
    assert!(err.message().contains("injected failure"));

    let hubs = client
        .all_hubs(Request::new(Noop {}))
        .await
        .unwrap()
        .into_inner();
    assert!(hubs.hubs.is_empty());
}

#[tokio::test]
async fn stream_without_registration_closes_cleanly() {
    let server = TestServer::spawn().await;
    let hub_token = server.hub_token().await;
    let mut client = server.client().await;

    let frames = tokio_stream::iter(vec![HubFrame {
        hub_reg: None,
        flow: Vec::new(),
    }]);
    let mut deltas = client
        .stream_activity(authed(frames, &hub_token))
        .await
        .unwrap()
        .into_inner();

    // Clean end of stream, no error, no session installed.
    assert!(deltas.message().await.unwrap().is_none());
    assert!(server.sessions.is_empty());
}

#[tokio::test]
async fn service_token_carries_connect_grant() {
    let server = TestServer::spawn().await;
    let hub_token = server.hub_token().await;
    let mut client = server.client().await;

    let token = client
        .request_service_token(authed(
            ServiceTokenRequest {
                namespace: "/org/internal".to_string(),
            },
            &hub_token,
        ))
        .await
        .unwrap()
        .into_inner()
        .token;

    let token = trellis_token::verify(&token, &server.public_key).unwrap();
    assert_eq!(token.role(), TokenRole::Service);
    assert_eq!(token.capability(Capability::Access), Some("/org/internal"));
    assert!(token.capability(Capability::Connect).is_some());
}
