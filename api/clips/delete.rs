use std::sync::Arc;

use vercel_runtime::{run, service_fn, Error, Request, Response, ResponseBody};

use clipdeck_functions::context::AppContext;
use clipdeck_functions::handlers::clips;
use clipdeck_functions::http::{collect_request, finish};
use clipdeck_functions::telemetry;

async fn handler(ctx: Arc<AppContext>, req: Request) -> Result<Response<ResponseBody>, Error> {
  let req = collect_request(req).await?;
  let result = clips::delete(&ctx, req).await;
  finish(&ctx.config, "clips-delete", result)
}

#[tokio::main]
async fn main() -> Result<(), Error> {
  telemetry::init();
  let ctx = Arc::new(AppContext::from_env());
  run(service_fn(move |req| handler(ctx.clone(), req))).await
}
