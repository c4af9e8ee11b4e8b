//! Handler tests over in-memory stores.

use std::sync::Arc;

use actix_web::http::header::{HeaderName, AUTHORIZATION};
use actix_web::http::StatusCode;
use actix_web::{test as actix_test, web, App};
use mockable::Clock;
use serde_json::{json, Value};

use super::*;
use crate::auth::sign_session;
use crate::orchestrator::{SyncSettings, SyncStores};
use crate::schemas::AccountFriend;
use crate::stores::memory::{
    MemoryAccountStore, MemoryCache, MemoryExpenseStore, MemoryGroupStore, MemoryInviteStore,
    MemoryLinkRequestStore,
};
use crate::test_support::{member_id, session_for, ManualClock};

const SECRET: &str = "route-secret";

fn state() -> web::Data<AppState> {
    state_with(Arc::new(MemoryAccountStore::new()))
}

fn state_with(accounts: Arc<MemoryAccountStore>) -> web::Data<AppState> {
    let clock: Arc<dyn Clock> = ManualClock::shared();
    let factory_clock = Arc::clone(&clock);
    let factory_accounts = Arc::clone(&accounts);
    let factory: OrchestratorFactory = Box::new(move |_session| {
        let stores = SyncStores {
            groups: Arc::new(MemoryGroupStore::new()),
            expenses: Arc::new(MemoryExpenseStore::new()),
            accounts: factory_accounts.clone(),
            cache: Arc::new(MemoryCache::new()),
        };
        SyncOrchestrator::new(stores, Arc::clone(&factory_clock), SyncSettings::default())
    });

    web::Data::new(AppState {
        session_secret: SECRET.to_owned(),
        registry: SessionRegistry::new(factory),
        invites: InviteClaimCoordinator::new(
            Arc::new(MemoryInviteStore::new()),
            Arc::clone(&clock),
            "https://opensplit.test/invite/",
        ),
        link_requests: LinkRequestService::new(
            Arc::new(MemoryLinkRequestStore::new()),
            accounts.clone(),
            Arc::clone(&clock),
        ),
        accounts: AccountService::new(accounts),
    })
}

fn authorization(account_id: &str, email: &str, member: u128) -> (HeaderName, String) {
    let session = session_for(account_id, email, member, account_id);
    (AUTHORIZATION, sign_session(&session, SECRET).expect("signed header"))
}

async fn body_json(response: actix_web::dev::ServiceResponse) -> Value {
    let body = actix_test::read_body(response).await;
    serde_json::from_slice(&body).expect("json body")
}

#[actix_web::test]
async fn requests_without_a_session_are_unauthorized() {
    let app = actix_test::init_service(App::new().app_data(state()).configure(configure)).await;

    let request = actix_test::TestRequest::post().uri("/sync").to_request();
    let response = actix_test::call_service(&app, request).await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let value = body_json(response).await;
    assert_eq!(value["code"], "session_missing");
}

#[actix_web::test]
async fn sync_returns_a_snapshot_and_unknown_groups_are_not_found() {
    let app = actix_test::init_service(App::new().app_data(state()).configure(configure)).await;

    let request = actix_test::TestRequest::post()
        .uri("/sync")
        .insert_header(authorization("acct-a", "a@example.com", 1))
        .to_request();
    let response = actix_test::call_service(&app, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    let value = body_json(response).await;
    assert_eq!(value["groups"], json!([]));

    let request = actix_test::TestRequest::get()
        .uri(&format!("/groups/{}/balance", member_id(0x999)))
        .insert_header(authorization("acct-a", "a@example.com", 1))
        .to_request();
    let response = actix_test::call_service(&app, request).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["code"], "group_not_found");
}

#[actix_web::test]
async fn duplicate_accounts_conflict() {
    let app = actix_test::init_service(App::new().app_data(state()).configure(configure)).await;
    let body = json!({ "email": "Ada@Example.com", "displayName": "Ada" });

    let request = actix_test::TestRequest::post()
        .uri("/accounts")
        .set_json(&body)
        .to_request();
    let response = actix_test::call_service(&app, request).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(body_json(response).await["email"], "ada@example.com");

    let request = actix_test::TestRequest::post()
        .uri("/accounts")
        .set_json(&body)
        .to_request();
    let response = actix_test::call_service(&app, request).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(response).await["code"], "account_duplicate");
}

#[actix_web::test]
async fn an_invite_is_claimed_once() {
    let app = actix_test::init_service(App::new().app_data(state()).configure(configure)).await;

    let request = actix_test::TestRequest::post()
        .uri("/invites")
        .insert_header(authorization("acct-a", "a@example.com", 1))
        .set_json(json!({ "targetMemberId": member_id(10), "targetMemberName": "Alice" }))
        .to_request();
    let response = actix_test::call_service(&app, request).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let link = body_json(response).await;
    let id = link["token"]["id"].as_str().expect("token id").to_owned();
    assert_eq!(link["url"], format!("https://opensplit.test/invite/{id}"));

    let request = actix_test::TestRequest::post()
        .uri(&format!("/invites/{id}/claim"))
        .insert_header(authorization("acct-b", "b@example.com", 2))
        .to_request();
    let response = actix_test::call_service(&app, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["linkedAccountId"], "acct-b");

    let request = actix_test::TestRequest::post()
        .uri(&format!("/invites/{id}/claim"))
        .insert_header(authorization("acct-c", "c@example.com", 3))
        .to_request();
    let response = actix_test::call_service(&app, request).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(response).await["code"], "link_already_claimed");

    let request = actix_test::TestRequest::get()
        .uri(&format!("/invites/{id}"))
        .to_request();
    let response = actix_test::call_service(&app, request).await;
    assert_eq!(body_json(response).await["status"], "already_claimed");
}

#[actix_web::test]
async fn self_links_are_bad_requests() {
    let app = actix_test::init_service(App::new().app_data(state()).configure(configure)).await;

    let request = actix_test::TestRequest::post()
        .uri("/invites")
        .insert_header(authorization("acct-a", "a@example.com", 1))
        .set_json(json!({ "targetMemberId": member_id(1), "targetMemberName": "Me" }))
        .to_request();
    let response = actix_test::call_service(&app, request).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "link_self_not_allowed");
}

#[actix_web::test]
async fn claims_reach_an_owner_who_has_not_synced_yet() {
    let accounts = Arc::new(MemoryAccountStore::new());
    accounts.put_friends(
        "a@example.com",
        vec![AccountFriend::named(member_id(40), "Riley")],
    );
    let app = actix_test::init_service(
        App::new()
            .app_data(state_with(accounts.clone()))
            .configure(configure),
    )
    .await;

    // Any authenticated call signs the owner in without syncing.
    let request = actix_test::TestRequest::get()
        .uri("/groups")
        .insert_header(authorization("acct-a", "a@example.com", 1))
        .to_request();
    let response = actix_test::call_service(&app, request).await;
    assert_eq!(response.status(), StatusCode::OK);

    let request = actix_test::TestRequest::post()
        .uri("/invites")
        .insert_header(authorization("acct-a", "a@example.com", 1))
        .set_json(json!({ "targetMemberId": member_id(40), "targetMemberName": "Riley" }))
        .to_request();
    let link = body_json(actix_test::call_service(&app, request).await).await;
    let id = link["token"]["id"].as_str().expect("token id").to_owned();

    let request = actix_test::TestRequest::post()
        .uri(&format!("/invites/{id}/claim"))
        .insert_header(authorization("acct-b", "b@example.com", 2))
        .to_request();
    let response = actix_test::call_service(&app, request).await;
    assert_eq!(response.status(), StatusCode::OK);

    let friends = accounts.friends_of("a@example.com");
    assert_eq!(friends.len(), 1);
    assert!(friends[0].has_linked_account);
    assert_eq!(friends[0].linked_account_id.as_deref(), Some("acct-b"));
}
