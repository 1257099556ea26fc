use std::sync::Arc;

use vercel_runtime::{run, service_fn, Error, Request, Response, ResponseBody};

use clipdeck_functions::context::AppContext;
use clipdeck_functions::handlers::email;
use clipdeck_functions::http::{collect_request, finish};
use clipdeck_functions::telemetry;

async fn handler(ctx: Arc<AppContext>, req: Request) -> Result<Response<ResponseBody>, Error> {
  let req = collect_request(req).await?;
  let result = email::handle(&ctx, req).await;
  finish(&ctx.config, "email-send", result)
}

#[tokio::main]
async fn main() -> Result<(), Error> {
  telemetry::init();
  let ctx = Arc::new(AppContext::from_env());
  run(service_fn(move |req| handler(ctx.clone(), req))).await
}
