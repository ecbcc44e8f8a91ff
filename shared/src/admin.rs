use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use tokio::net::TcpListener;

/// Operational endpoints for the service: liveness at `/health`, readiness
/// at `/ready`. Readiness is delegated to a closure so the caller decides
/// what "ready" means (for the quoter: at least one healthy RPC provider).
pub struct AdminService<F> {
    is_ready: F,
}

impl<F> AdminService<F>
where
    F: Fn() -> bool,
{
    pub fn new(is_ready: F) -> Self {
        Self { is_ready }
    }
}

fn respond(path: &str, ready: bool) -> Response<BoxBody<Bytes, Infallible>> {
    let ok_body = || Full::new(Bytes::from("ok\n")).boxed();
    let empty = |status: StatusCode| {
        let mut res = Response::new(Full::new(Bytes::new()).boxed());
        *res.status_mut() = status;
        res
    };

    match path {
        "/health" => Response::new(ok_body()),
        "/ready" => match ready {
            true => Response::new(ok_body()),
            false => empty(StatusCode::SERVICE_UNAVAILABLE),
        },
        _ => empty(StatusCode::NOT_FOUND),
    }
}

impl<F> Service<Request<Incoming>> for AdminService<F>
where
    F: Fn() -> bool + Clone + Send + Sync + 'static,
{
    type Response = Response<BoxBody<Bytes, Infallible>>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let ready = (self.is_ready)();
        let path = req.uri().path().to_string();
        Box::pin(async move { Ok(respond(&path, ready)) })
    }
}

/// Bind the admin listener and serve it until the process exits.
pub async fn run_admin_service<F>(host: &str, port: u16, is_ready: F) -> std::io::Result<()>
where
    F: Fn() -> bool + Clone + Send + Sync + 'static,
{
    let listener = TcpListener::bind(format!("{host}:{port}")).await?;
    tracing::info!(host, port, "admin listener started");

    loop {
        let (stream, _peer_addr) = listener.accept().await?;
        let _ = stream.set_nodelay(true);
        let io = TokioIo::new(stream);
        let svc = AdminService::new(is_ready.clone());

        tokio::spawn(async move {
            let _ = Builder::new(TokioExecutor::new())
                .serve_connection(io, svc)
                .await;
        });
    }
}
