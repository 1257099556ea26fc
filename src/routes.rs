use bytes::Bytes;
use hyper::Request;

use crate::context::AppContext;
use crate::handlers;
use crate::http::HandlerResult;

const NETLIFY_PREFIX: &str = "/.netlify/functions/";
const API_PREFIX: &str = "/api/";

/// Every deployable function. Vercel binaries each serve one route; the bridge
/// binary resolves the route from the request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  Oauth,
  Connections,
  Publish,
  ClipsDelete,
  ClipsProcess,
  QueueProcess,
  QueueAuto,
  EmailSend,
  Waitlist,
}

impl Route {
  pub const ALL: [Route; 9] = [
    Route::Oauth,
    Route::Connections,
    Route::Publish,
    Route::ClipsDelete,
    Route::ClipsProcess,
    Route::QueueProcess,
    Route::QueueAuto,
    Route::EmailSend,
    Route::Waitlist,
  ];

  pub fn name(&self) -> &'static str {
    match self {
      Route::Oauth => "oauth",
      Route::Connections => "connections",
      Route::Publish => "publish",
      Route::ClipsDelete => "clips-delete",
      Route::ClipsProcess => "clips-process",
      Route::QueueProcess => "queue-process",
      Route::QueueAuto => "queue-auto",
      Route::EmailSend => "email-send",
      Route::Waitlist => "waitlist",
    }
  }

  /// Canonical names plus the legacy function names cron jobs still call.
  pub fn from_name(name: &str) -> Option<Self> {
    match name {
      "processQueue" | "process-queue" => Some(Route::QueueProcess),
      "autoProcessQueue" | "auto-process-queue" => Some(Route::QueueAuto),
      "process-clips" => Some(Route::ClipsProcess),
      "delete-clip" => Some(Route::ClipsDelete),
      "send-email" => Some(Route::EmailSend),
      other => Self::ALL.into_iter().find(|r| r.name() == other),
    }
  }

  /// `/.netlify/functions/<name>` or `/api/<a>/<b>` (joined as `<a>-<b>`).
  pub fn resolve(path: &str) -> Option<Self> {
    let path = path.split('?').next().unwrap_or_default().trim_end_matches('/');
    if let Some(rest) = path.strip_prefix(NETLIFY_PREFIX) {
      return rest.split('/').next().and_then(Self::from_name);
    }
    let rest = path.strip_prefix(API_PREFIX)?;
    let name = rest.split('/').filter(|s| !s.is_empty()).collect::<Vec<_>>().join("-");
    Self::from_name(&name)
  }
}

pub async fn dispatch(ctx: &AppContext, route: Route, req: Request<Bytes>) -> HandlerResult {
  match route {
    Route::Oauth => handlers::oauth::handle(ctx, req).await,
    Route::Connections => handlers::connections::handle(ctx, req).await,
    Route::Publish => handlers::publish::handle(ctx, req).await,
    Route::ClipsDelete => handlers::clips::delete(ctx, req).await,
    Route::ClipsProcess => handlers::clips::process(ctx, req).await,
    Route::QueueProcess => handlers::queue::process(ctx, req).await,
    Route::QueueAuto => handlers::queue::auto(ctx, req).await,
    Route::EmailSend => handlers::email::handle(ctx, req).await,
    Route::Waitlist => handlers::waitlist::handle(ctx, req).await,
  }
}
