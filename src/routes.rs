//! HTTP surface. Every route but account registration and invite lookup needs
//! a signed session header; see [`crate::auth`].

use std::collections::HashMap;
use std::sync::Arc;

use actix_web::http::StatusCode;
use actix_web::{delete, get, post, put, web, HttpRequest, HttpResponse, ResponseError};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::accounts::AccountService;
use crate::auth::session_from_request;
use crate::error::SyncError;
use crate::invites::InviteClaimCoordinator;
use crate::link_requests::LinkRequestService;
use crate::orchestrator::SyncOrchestrator;
use crate::schemas::{AccountId, Expense, GroupId, LinkClaim, Member, MemberId, Session};

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl ResponseError for SyncError {
    fn status_code(&self) -> StatusCode {
        match self {
            SyncError::SessionMissing | SyncError::Unauthorized => StatusCode::UNAUTHORIZED,
            SyncError::AccountNotFound(_)
            | SyncError::ExpenseNotFound(_)
            | SyncError::GroupNotFound(_)
            | SyncError::LinkInvalid(_) => StatusCode::NOT_FOUND,
            SyncError::AccountDuplicate(_)
            | SyncError::LinkAlreadyClaimed
            | SyncError::LinkDuplicateRequest
            | SyncError::LinkMemberAlreadyLinked(_)
            | SyncError::LinkAccountAlreadyLinked(_) => StatusCode::CONFLICT,
            SyncError::LinkExpired => StatusCode::GONE,
            SyncError::InvalidEmail(_)
            | SyncError::ExpenseInvalidAmount
            | SyncError::ExpenseSplitMismatch { .. }
            | SyncError::GroupInvalidConfiguration(_)
            | SyncError::LinkSelfNotAllowed => StatusCode::BAD_REQUEST,
            SyncError::Network(_) | SyncError::Api { .. } => StatusCode::BAD_GATEWAY,
            SyncError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            SyncError::ConfigurationMissing(_) | SyncError::Underlying(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorBody {
            code: self.code(),
            message: self.to_string(),
        })
    }
}

pub type OrchestratorFactory = Box<dyn Fn(&Session) -> SyncOrchestrator + Send + Sync>;

/// One orchestrator per account, created and signed in on first use.
pub struct SessionRegistry {
    factory: OrchestratorFactory,
    orchestrators: Mutex<HashMap<AccountId, Arc<SyncOrchestrator>>>,
}

impl SessionRegistry {
    pub fn new(factory: OrchestratorFactory) -> Self {
        Self {
            factory,
            orchestrators: Mutex::new(HashMap::new()),
        }
    }

    pub async fn for_session(&self, session: &Session) -> Result<Arc<SyncOrchestrator>, SyncError> {
        let orchestrator = {
            let mut orchestrators = self.orchestrators.lock().await;
            Arc::clone(
                orchestrators
                    .entry(session.account_id.clone())
                    .or_insert_with(|| Arc::new((self.factory)(session))),
            )
        };
        if orchestrator.session().await.as_ref() != Some(session) {
            orchestrator.sign_in(session.clone()).await?;
        }
        Ok(orchestrator)
    }

    pub async fn existing(&self, account_id: &str) -> Option<Arc<SyncOrchestrator>> {
        self.orchestrators.lock().await.get(account_id).cloned()
    }

    pub async fn remove(&self, account_id: &str) -> Option<Arc<SyncOrchestrator>> {
        self.orchestrators.lock().await.remove(account_id)
    }

    /// Write out every pending cache snapshot. Called once the server has stopped.
    pub async fn flush_all(&self) {
        let orchestrators: Vec<_> = self.orchestrators.lock().await.values().cloned().collect();
        for orchestrator in orchestrators {
            if let Err(err) = orchestrator.flush().await {
                warn!(error = %err, "could not flush cache on shutdown");
            }
        }
    }
}

pub struct AppState {
    pub session_secret: String,
    pub registry: SessionRegistry,
    pub invites: InviteClaimCoordinator,
    pub link_requests: LinkRequestService,
    pub accounts: AccountService,
}

impl AppState {
    fn session(&self, request: &HttpRequest) -> Result<Session, SyncError> {
        session_from_request(request, &self.session_secret).ok_or(SyncError::SessionMissing)
    }

    async fn orchestrator(
        &self,
        request: &HttpRequest,
    ) -> Result<(Session, Arc<SyncOrchestrator>), SyncError> {
        let session = self.session(request)?;
        let orchestrator = self.registry.for_session(&session).await?;
        Ok((session, orchestrator))
    }

    /// Tell the owner of a linked member about the link, through their live
    /// orchestrator when one exists.
    async fn propagate_link(&self, owner_id: &str, owner_email: &str, claim: &LinkClaim) {
        let outcome = match self.registry.existing(owner_id).await {
            Some(orchestrator) => match orchestrator.apply_link(claim).await {
                Ok(_) => Ok(()),
                Err(SyncError::LinkInvalid(_)) => {
                    self.accounts.record_link(owner_email, claim).await
                }
                Err(err) => Err(err),
            },
            None => self.accounts.record_link(owner_email, claim).await,
        };
        if let Err(err) = outcome {
            warn!(owner_id, error = %err, "could not propagate link to its owner");
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewGroup {
    name: String,
    members: Vec<Member>,
}

#[derive(Deserialize)]
struct GroupIds {
    ids: Vec<GroupId>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewFriend {
    name: String,
    nickname: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewInvite {
    target_member_id: MemberId,
    target_member_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewLinkRequest {
    recipient_email: String,
    target_member_id: MemberId,
    target_member_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewAccount {
    email: String,
    display_name: String,
}

#[post("/sync")]
async fn sync(state: web::Data<AppState>, request: HttpRequest) -> Result<HttpResponse, SyncError> {
    let (_, orchestrator) = state.orchestrator(&request).await?;
    Ok(HttpResponse::Ok().json(orchestrator.sync().await?))
}

#[delete("/session")]
async fn sign_out(
    state: web::Data<AppState>,
    request: HttpRequest,
) -> Result<HttpResponse, SyncError> {
    let session = state.session(&request)?;
    if let Some(orchestrator) = state.registry.remove(&session.account_id).await {
        orchestrator.sign_out().await?;
    }
    Ok(HttpResponse::NoContent().finish())
}

#[get("/groups")]
async fn get_groups(
    state: web::Data<AppState>,
    request: HttpRequest,
) -> Result<HttpResponse, SyncError> {
    let (_, orchestrator) = state.orchestrator(&request).await?;
    Ok(HttpResponse::Ok().json(orchestrator.snapshot().await.groups))
}

#[post("/groups")]
async fn add_group(
    state: web::Data<AppState>,
    request: HttpRequest,
    json: web::Json<NewGroup>,
) -> Result<HttpResponse, SyncError> {
    let (_, orchestrator) = state.orchestrator(&request).await?;
    let NewGroup { name, members } = json.into_inner();
    Ok(HttpResponse::Created().json(orchestrator.add_group(&name, members).await?))
}

#[delete("/groups")]
async fn delete_groups(
    state: web::Data<AppState>,
    request: HttpRequest,
    json: web::Json<GroupIds>,
) -> Result<HttpResponse, SyncError> {
    let (_, orchestrator) = state.orchestrator(&request).await?;
    orchestrator.delete_groups(&json.ids).await?;
    Ok(HttpResponse::NoContent().finish())
}

#[get("/groups/{id}/balance")]
async fn get_balance(
    state: web::Data<AppState>,
    request: HttpRequest,
    id: web::Path<GroupId>,
) -> Result<HttpResponse, SyncError> {
    let (_, orchestrator) = state.orchestrator(&request).await?;
    Ok(HttpResponse::Ok().json(orchestrator.balances(id.into_inner()).await?))
}

#[get("/expenses")]
async fn get_expenses(
    state: web::Data<AppState>,
    request: HttpRequest,
) -> Result<HttpResponse, SyncError> {
    let (_, orchestrator) = state.orchestrator(&request).await?;
    Ok(HttpResponse::Ok().json(orchestrator.snapshot().await.expenses))
}

#[post("/expenses")]
async fn add_expense(
    state: web::Data<AppState>,
    request: HttpRequest,
    expense: web::Json<Expense>,
) -> Result<HttpResponse, SyncError> {
    let (_, orchestrator) = state.orchestrator(&request).await?;
    Ok(HttpResponse::Ok().json(orchestrator.add_expense(expense.into_inner()).await?))
}

#[put("/expenses/{id}")]
async fn update_expense(
    state: web::Data<AppState>,
    request: HttpRequest,
    id: web::Path<Uuid>,
    expense: web::Json<Expense>,
) -> Result<HttpResponse, SyncError> {
    let (_, orchestrator) = state.orchestrator(&request).await?;
    let expense = Expense {
        id: id.into_inner(),
        ..expense.into_inner()
    };
    Ok(HttpResponse::Ok().json(orchestrator.update_expense(expense).await?))
}

#[delete("/expenses/{id}")]
async fn delete_expense(
    state: web::Data<AppState>,
    request: HttpRequest,
    id: web::Path<Uuid>,
) -> Result<HttpResponse, SyncError> {
    let (_, orchestrator) = state.orchestrator(&request).await?;
    orchestrator.delete_expense(id.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}

#[get("/friends")]
async fn get_friends(
    state: web::Data<AppState>,
    request: HttpRequest,
) -> Result<HttpResponse, SyncError> {
    let (_, orchestrator) = state.orchestrator(&request).await?;
    if let Err(err) = orchestrator.reconcile_link_state().await {
        warn!(error = %err, "serving friends without fresh link status");
    }
    Ok(HttpResponse::Ok().json(orchestrator.friends().await))
}

#[get("/friends/selectable")]
async fn get_selectable_friends(
    state: web::Data<AppState>,
    request: HttpRequest,
) -> Result<HttpResponse, SyncError> {
    let (_, orchestrator) = state.orchestrator(&request).await?;
    Ok(HttpResponse::Ok().json(orchestrator.selectable_friends().await))
}

#[post("/friends")]
async fn import_friend(
    state: web::Data<AppState>,
    request: HttpRequest,
    json: web::Json<NewFriend>,
) -> Result<HttpResponse, SyncError> {
    let (_, orchestrator) = state.orchestrator(&request).await?;
    let entry = orchestrator
        .import_friend(&json.name, json.nickname.as_deref())
        .await?;
    Ok(HttpResponse::Created().json(entry))
}

#[post("/recover")]
async fn recover(
    state: web::Data<AppState>,
    request: HttpRequest,
) -> Result<HttpResponse, SyncError> {
    let (_, orchestrator) = state.orchestrator(&request).await?;
    Ok(HttpResponse::Ok().json(orchestrator.reconcile_after_network_recovery().await?))
}

#[post("/invites")]
async fn create_invite(
    state: web::Data<AppState>,
    request: HttpRequest,
    json: web::Json<NewInvite>,
) -> Result<HttpResponse, SyncError> {
    let session = state.session(&request)?;
    let link = state
        .invites
        .generate(Some(&session), json.target_member_id, &json.target_member_name)
        .await?;
    Ok(HttpResponse::Created().json(link))
}

#[get("/invites")]
async fn get_invites(
    state: web::Data<AppState>,
    request: HttpRequest,
) -> Result<HttpResponse, SyncError> {
    let session = state.session(&request)?;
    Ok(HttpResponse::Ok().json(state.invites.fetch_active(Some(&session)).await?))
}

#[get("/invites/{id}")]
async fn validate_invite(
    state: web::Data<AppState>,
    id: web::Path<Uuid>,
) -> Result<HttpResponse, SyncError> {
    Ok(HttpResponse::Ok().json(state.invites.validate(id.into_inner()).await?))
}

#[post("/invites/{id}/claim")]
async fn claim_invite(
    state: web::Data<AppState>,
    request: HttpRequest,
    id: web::Path<Uuid>,
) -> Result<HttpResponse, SyncError> {
    let session = state.session(&request)?;
    let (token, claim) = state.invites.claim(Some(&session), id.into_inner()).await?;
    state
        .propagate_link(&token.creator_id, &token.creator_email, &claim)
        .await;
    Ok(HttpResponse::Ok().json(claim))
}

#[delete("/invites/{id}")]
async fn revoke_invite(
    state: web::Data<AppState>,
    request: HttpRequest,
    id: web::Path<Uuid>,
) -> Result<HttpResponse, SyncError> {
    let session = state.session(&request)?;
    state
        .invites
        .revoke(id.into_inner(), &session.account_id)
        .await?;
    Ok(HttpResponse::NoContent().finish())
}

#[post("/link-requests")]
async fn create_link_request(
    state: web::Data<AppState>,
    request: HttpRequest,
    json: web::Json<NewLinkRequest>,
) -> Result<HttpResponse, SyncError> {
    let session = state.session(&request)?;
    let created = state
        .link_requests
        .create(
            Some(&session),
            &json.recipient_email,
            json.target_member_id,
            &json.target_member_name,
        )
        .await?;
    Ok(HttpResponse::Created().json(created))
}

#[get("/link-requests/incoming")]
async fn incoming_link_requests(
    state: web::Data<AppState>,
    request: HttpRequest,
) -> Result<HttpResponse, SyncError> {
    let session = state.session(&request)?;
    Ok(HttpResponse::Ok().json(state.link_requests.incoming(Some(&session)).await?))
}

#[get("/link-requests/outgoing")]
async fn outgoing_link_requests(
    state: web::Data<AppState>,
    request: HttpRequest,
) -> Result<HttpResponse, SyncError> {
    let session = state.session(&request)?;
    Ok(HttpResponse::Ok().json(state.link_requests.outgoing(Some(&session)).await?))
}

#[get("/link-requests/previous")]
async fn previous_link_requests(
    state: web::Data<AppState>,
    request: HttpRequest,
) -> Result<HttpResponse, SyncError> {
    let session = state.session(&request)?;
    Ok(HttpResponse::Ok().json(state.link_requests.previous(Some(&session)).await?))
}

#[post("/link-requests/{id}/accept")]
async fn accept_link_request(
    state: web::Data<AppState>,
    request: HttpRequest,
    id: web::Path<Uuid>,
) -> Result<HttpResponse, SyncError> {
    let session = state.session(&request)?;
    let (accepted, claim) = state
        .link_requests
        .accept(Some(&session), id.into_inner())
        .await?;
    state
        .propagate_link(&accepted.requester_id, &accepted.requester_email, &claim)
        .await;
    Ok(HttpResponse::Ok().json(accepted))
}

#[post("/link-requests/{id}/decline")]
async fn decline_link_request(
    state: web::Data<AppState>,
    request: HttpRequest,
    id: web::Path<Uuid>,
) -> Result<HttpResponse, SyncError> {
    let session = state.session(&request)?;
    let declined = state
        .link_requests
        .decline(Some(&session), id.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(declined))
}

#[delete("/link-requests/{id}")]
async fn cancel_link_request(
    state: web::Data<AppState>,
    request: HttpRequest,
    id: web::Path<Uuid>,
) -> Result<HttpResponse, SyncError> {
    let session = state.session(&request)?;
    state
        .link_requests
        .cancel(Some(&session), id.into_inner())
        .await?;
    Ok(HttpResponse::NoContent().finish())
}

#[post("/accounts")]
async fn register_account(
    state: web::Data<AppState>,
    json: web::Json<NewAccount>,
) -> Result<HttpResponse, SyncError> {
    let account = state
        .accounts
        .register(&json.email, &json.display_name)
        .await?;
    Ok(HttpResponse::Created().json(account))
}

#[get("/accounts/{email}")]
async fn lookup_account(
    state: web::Data<AppState>,
    request: HttpRequest,
    email: web::Path<String>,
) -> Result<HttpResponse, SyncError> {
    state.session(&request)?;
    Ok(HttpResponse::Ok().json(state.accounts.lookup(&email).await?))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(sync)
        .service(sign_out)
        .service(get_groups)
        .service(add_group)
        .service(delete_groups)
        .service(get_balance)
        .service(get_expenses)
        .service(add_expense)
        .service(update_expense)
        .service(delete_expense)
        .service(get_selectable_friends)
        .service(get_friends)
        .service(import_friend)
        .service(recover)
        .service(create_invite)
        .service(get_invites)
        .service(validate_invite)
        .service(claim_invite)
        .service(revoke_invite)
        .service(incoming_link_requests)
        .service(outgoing_link_requests)
        .service(previous_link_requests)
        .service(create_link_request)
        .service(accept_link_request)
        .service(decline_link_request)
        .service(cancel_link_request)
        .service(register_account)
        .service(lookup_account);
}

#[cfg(test)]
#[path = "routes_tests.rs"]
mod tests;
