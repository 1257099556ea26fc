use std::sync::Arc;

use lambda_runtime::{service_fn, Error, LambdaEvent};
use serde_json::Value;

use clipdeck_functions::adapter::{handle_event, LambdaResponse};
use clipdeck_functions::context::AppContext;
use clipdeck_functions::telemetry;

async fn handle_request(ctx: Arc<AppContext>, event: LambdaEvent<Value>) -> Result<LambdaResponse, Error> {
  Ok(handle_event(&ctx, event.payload).await)
}

#[tokio::main]
async fn main() -> Result<(), Error> {
  telemetry::init();
  let ctx = Arc::new(AppContext::from_env());
  lambda_runtime::run(service_fn(move |event| handle_request(ctx.clone(), event))).await
}
