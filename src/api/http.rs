//! HTTP endpoint surface on `may_minihttp`
//!
//! Thin adapter: parse method/path/headers/body, hand everything to the API
//! wrapper, write the wrapper's response back. All semantics live in
//! [`run_mutation`](crate::api::run_mutation) and the services; nothing here
//! makes decisions beyond routing.
//!
//! Headers consumed: `x-actor-id` (verified actor id from the upstream
//! identity provider) and `idempotency-key`.

use crate::api::{run_mutation, ApiResponse};
use crate::context::{self, ActorId};
use crate::error::{ServiceError, ServiceResult};
use crate::executor::{MayPostgresExecutor, RowExecutor};
use crate::idempotency::IdempotencyStore;
use crate::notify::Notifier;
use crate::scoped::ScopedExecutor;
use crate::services::{periods, reports, transactions, ServiceContext};
use crate::storage::FileStore;
use may_minihttp::{HttpServer, HttpService, Request, Response};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::io::{self, Read};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Everything the endpoints need, constructed once at startup.
pub struct AppState {
    pub db: MayPostgresExecutor,
    pub idempotency: Box<dyn IdempotencyStore>,
    pub files: Box<dyn FileStore>,
    pub notifier: Box<dyn Notifier>,
    pub mutation_timeout: Duration,
}

impl AppState {
    fn service_context(&self) -> ServiceContext<'_> {
        ServiceContext::new(
            &self.db,
            self.files.as_ref(),
            self.notifier.as_ref(),
            self.mutation_timeout,
        )
    }
}

#[derive(Clone)]
pub struct RowguardService(pub Arc<AppState>);

impl HttpService for RowguardService {
    fn call(&mut self, req: Request, res: &mut Response) -> io::Result<()> {
        let method = req.method().to_string();
        let path = req.path().to_string();

        let mut actor: Option<String> = None;
        let mut idempotency_key: Option<String> = None;
        for header in req.headers() {
            if header.name.eq_ignore_ascii_case("x-actor-id") {
                actor = Some(String::from_utf8_lossy(header.value).into_owned());
            } else if header.name.eq_ignore_ascii_case("idempotency-key") {
                idempotency_key = Some(String::from_utf8_lossy(header.value).into_owned());
            }
        }

        let mut body = Vec::new();
        if let Err(err) = req.body().read_to_end(&mut body) {
            log::warn!("failed to read request body: {err}");
        }

        let response = self.dispatch(
            &method,
            &path,
            actor.as_deref(),
            idempotency_key.as_deref(),
            &body,
        );
        write_response(res, response);
        Ok(())
    }
}

impl RowguardService {
    fn dispatch(
        &self,
        method: &str,
        path: &str,
        actor: Option<&str>,
        idempotency_key: Option<&str>,
        body: &[u8],
    ) -> ApiResponse {
        let state = &self.0;
        let segments: Vec<&str> = path
            .split('?')
            .next()
            .unwrap_or(path)
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();

        let mutate = |handler: &mut dyn FnMut() -> ServiceResult<ApiResponse>| {
            run_mutation(state.idempotency.as_ref(), actor, idempotency_key, || {
                handler()
            })
        };

        match (method, segments.as_slice()) {
            ("GET", ["health"]) => match state.db.check_health() {
                Ok(true) => ApiResponse::ok(json!({ "status": "ok" })),
                _ => ApiResponse {
                    status: 503,
                    body: Some(json!({ "status": "degraded" })),
                },
            },

            // Reads go through the scoping proxy: with a verified actor the
            // row-security policies decide visibility, without one the
            // operation passes through unscoped.
            ("GET", ["transactions"]) => {
                let raw = match actor {
                    Some(raw) => raw,
                    None => return ApiResponse::from_error(&ServiceError::Unauthorized),
                };
                let actor_id = match ActorId::parse(raw) {
                    Ok(actor_id) => actor_id,
                    Err(err) => return ApiResponse::from_error(&ServiceError::from(err)),
                };
                let scoped = ScopedExecutor::new(state.db.client().clone());
                context::run_with_actor(actor_id, || list_transactions(&scoped))
            }
            ("GET", ["periods"]) => {
                let scoped = ScopedExecutor::new(state.db.client().clone());
                match actor.map(ActorId::parse) {
                    Some(Ok(actor_id)) => {
                        context::run_with_actor(actor_id, || list_periods(&scoped))
                    }
                    Some(Err(err)) => ApiResponse::from_error(&ServiceError::from(err)),
                    None => list_periods(&scoped),
                }
            }

            ("POST", ["transactions"]) => mutate(&mut || {
                let input: transactions::CreateTransactionInput = parse_json(body)?;
                let created = transactions::create_transaction(&state.service_context(), &input)?;
                Ok(ApiResponse::created(created.to_json()))
            }),
            ("PUT", ["transactions", id]) => {
                let id = match parse_uuid(id) {
                    Ok(id) => id,
                    Err(err) => return ApiResponse::from_error(&err),
                };
                mutate(&mut || {
                    let input: transactions::UpdateTransactionInput = parse_json(body)?;
                    let updated =
                        transactions::update_transaction(&state.service_context(), id, &input)?;
                    Ok(ApiResponse::ok(updated.to_json()))
                })
            }
            ("DELETE", ["transactions", id]) => {
                let id = match parse_uuid(id) {
                    Ok(id) => id,
                    Err(err) => return ApiResponse::from_error(&err),
                };
                mutate(&mut || {
                    transactions::delete_transaction(&state.service_context(), id)?;
                    Ok(ApiResponse::ok(json!({ "deleted": id })))
                })
            }

            ("POST", ["reports"]) => mutate(&mut || {
                let input: reports::CreateReportInput = parse_json(body)?;
                let created = reports::create_report(&state.service_context(), &input)?;
                Ok(ApiResponse::created(created.to_json()))
            }),
            ("PUT", ["reports", id]) => {
                let id = match parse_uuid(id) {
                    Ok(id) => id,
                    Err(err) => return ApiResponse::from_error(&err),
                };
                mutate(&mut || {
                    let input: reports::UpdateReportInput = parse_json(body)?;
                    let updated = reports::update_report(&state.service_context(), id, &input)?;
                    Ok(ApiResponse::ok(updated.to_json()))
                })
            }
            ("POST", ["reports", id, "submit"]) => {
                let id = match parse_uuid(id) {
                    Ok(id) => id,
                    Err(err) => return ApiResponse::from_error(&err),
                };
                mutate(&mut || {
                    let submitted = reports::submit_report(&state.service_context(), id)?;
                    Ok(ApiResponse::ok(submitted.to_json()))
                })
            }
            ("POST", ["reports", id, "approve"]) => {
                let id = match parse_uuid(id) {
                    Ok(id) => id,
                    Err(err) => return ApiResponse::from_error(&err),
                };
                mutate(&mut || {
                    let approved = reports::approve_report(&state.service_context(), id)?;
                    Ok(ApiResponse::ok(approved.to_json()))
                })
            }
            ("POST", ["reports", id, "reject"]) => {
                let id = match parse_uuid(id) {
                    Ok(id) => id,
                    Err(err) => return ApiResponse::from_error(&err),
                };
                mutate(&mut || {
                    let input: RejectInput = parse_json(body)?;
                    let rejected =
                        reports::reject_report(&state.service_context(), id, &input.reason)?;
                    Ok(ApiResponse::ok(rejected.to_json()))
                })
            }

            ("POST", ["periods"]) => mutate(&mut || {
                let input: periods::CreatePeriodInput = parse_json(body)?;
                let created = periods::create_period(&state.service_context(), &input)?;
                Ok(ApiResponse::created(created.to_json()))
            }),
            ("POST", ["periods", id, "close"]) => {
                let id = match parse_uuid(id) {
                    Ok(id) => id,
                    Err(err) => return ApiResponse::from_error(&err),
                };
                mutate(&mut || {
                    let closed = periods::close_period(&state.service_context(), id)?;
                    Ok(ApiResponse::ok(closed.to_json()))
                })
            }

            _ => ApiResponse {
                status: 404,
                body: Some(json!({ "error": "no such endpoint", "code": "NOT_FOUND" })),
            },
        }
    }
}

#[derive(serde::Deserialize)]
struct RejectInput {
    reason: String,
}

fn list_transactions(db: &ScopedExecutor) -> ApiResponse {
    let rows = db.query_all(
        "SELECT id, kind, description, amount, effective_date, created_by \
         FROM financial_transactions ORDER BY effective_date DESC, id LIMIT 100",
        &[],
    );
    match rows {
        Ok(rows) => {
            let items: Vec<serde_json::Value> = rows
                .iter()
                .map(|row| {
                    let amount: rust_decimal::Decimal = row.get(3);
                    json!({
                        "id": row.get::<_, Uuid>(0),
                        "kind": row.get::<_, String>(1),
                        "description": row.get::<_, String>(2),
                        "amount": amount,
                        "effective_date": row.get::<_, chrono::NaiveDate>(4),
                        "created_by": row.get::<_, String>(5),
                    })
                })
                .collect();
            ApiResponse::ok(json!({ "transactions": items }))
        }
        Err(err) => ApiResponse::from_error(&ServiceError::from(err)),
    }
}

fn list_periods(db: &ScopedExecutor) -> ApiResponse {
    let rows = db.query_all(
        "SELECT id, period_type, start_date, end_date, status \
         FROM accounting_periods ORDER BY start_date",
        &[],
    );
    match rows {
        Ok(rows) => {
            let items: Vec<serde_json::Value> = rows
                .iter()
                .map(|row| {
                    json!({
                        "id": row.get::<_, Uuid>(0),
                        "period_type": row.get::<_, String>(1),
                        "start_date": row.get::<_, chrono::NaiveDate>(2),
                        "end_date": row.get::<_, chrono::NaiveDate>(3),
                        "status": row.get::<_, String>(4),
                    })
                })
                .collect();
            ApiResponse::ok(json!({ "periods": items }))
        }
        Err(err) => ApiResponse::from_error(&ServiceError::from(err)),
    }
}

fn parse_json<T: DeserializeOwned>(body: &[u8]) -> ServiceResult<T> {
    serde_json::from_slice(body)
        .map_err(|err| ServiceError::Validation(format!("invalid request body: {err}")))
}

fn parse_uuid(raw: &str) -> ServiceResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| ServiceError::Validation(format!("invalid id {raw:?}")))
}

fn write_response(res: &mut Response, api: ApiResponse) {
    res.status_code(api.status as usize, reason_phrase(api.status));
    if let Some(body) = api.body {
        res.header("Content-Type: application/json");
        let bytes = serde_json::to_vec(&body).unwrap_or_else(|_| b"{}".to_vec());
        res.body_vec(bytes);
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        409 => "Conflict",
        503 => "Service Unavailable",
        _ => "Internal Server Error",
    }
}

/// Start the HTTP server and the idempotency retention sweep.
///
/// Returns the server's coroutine handle; `join()` it to block until
/// shutdown.
pub fn serve(
    state: AppState,
    addr: &str,
    purge_interval: Duration,
) -> io::Result<may::coroutine::JoinHandle<()>> {
    #[cfg(feature = "tracing")]
    crate::metrics::tracing_helpers::init_registry();

    let state = Arc::new(state);

    // Retention sweep: the claim path never consults expires_at, removal of
    // stale records is this worker's job alone.
    let purge_state = Arc::clone(&state);
    may::go!(move || loop {
        may::coroutine::sleep(purge_interval);
        match purge_state.idempotency.purge_expired() {
            Ok(0) => {}
            Ok(removed) => log::info!("purged {removed} expired idempotency records"),
            Err(err) => log::warn!("idempotency purge failed: {err}"),
        }
    });

    HttpServer(RowguardService(state)).start(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uuid() {
        assert!(parse_uuid("3050a93c-3b7c-4af2-9df4-8bd3f9d3a3b1").is_ok());
        let err = parse_uuid("not-a-uuid").unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_parse_json_rejects_garbage() {
        let err = parse_json::<RejectInput>(b"{").unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        let ok: RejectInput = parse_json(br#"{"reason":"totals do not add up"}"#).unwrap();
        assert_eq!(ok.reason, "totals do not add up");
    }

    #[test]
    fn test_reason_phrases_cover_wrapper_statuses() {
        for status in [200, 201, 204, 400, 401, 403, 404, 409] {
            assert_ne!(reason_phrase(status), "Internal Server Error");
        }
        assert_eq!(reason_phrase(500), "Internal Server Error");
    }
}
