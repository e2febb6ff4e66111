use actix_multipart::Multipart;
use actix_web::web::{self, BytesMut};
use actix_web::{error, Error, HttpRequest, HttpResponse, Result};
use futures_util::StreamExt;
use serde_json::json;

use crate::auth::AuthenticatedUser;
use crate::models::PredictionRequest;
use crate::orchestrator::Orchestrator;

/// Multipart field carrying the X-ray.
pub const UPLOAD_FIELD: &str = "xray_file";

#[derive(Debug, Clone, Copy)]
pub struct UploadLimits {
    pub max_bytes: usize,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/").route(web::get().to(root)))
        .service(web::resource("/predict/all").route(web::post().to(predict_all)));
}

pub async fn root() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "message": "X-Vision backend is running!" }))
}

pub async fn predict_all(
    req: HttpRequest,
    user: AuthenticatedUser,
    payload: Multipart,
    orchestrator: web::Data<Orchestrator>,
    limits: web::Data<UploadLimits>,
) -> Result<HttpResponse, Error> {
    let image = read_upload(payload, limits.max_bytes).await?;
    tracing::debug!(user_id = %user.0, len = image.len(), "received upload");

    let request = PredictionRequest {
        image,
        user_id: user.0,
    };
    let response = orchestrator
        .submit_prediction(request, &request_base_url(&req))
        .await?;
    Ok(HttpResponse::Ok().json(response))
}

/// Collects the `xray_file` part into memory; other parts are drained and ignored.
async fn read_upload(mut payload: Multipart, max_bytes: usize) -> Result<web::Bytes, Error> {
    let mut upload: Option<BytesMut> = None;

    while let Some(item) = payload.next().await {
        let mut field = item?;
        let wanted = field.content_disposition().get_name() == Some(UPLOAD_FIELD);

        let mut buf = BytesMut::new();
        while let Some(chunk) = field.next().await {
            let data = chunk?;
            if !wanted {
                continue;
            }
            if buf.len() + data.len() > max_bytes {
                return Err(error::ErrorPayloadTooLarge(format!(
                    "upload exceeds {} bytes",
                    max_bytes
                )));
            }
            buf.extend_from_slice(&data);
        }

        if wanted && upload.is_none() {
            upload = Some(buf);
        }
    }

    upload
        .map(BytesMut::freeze)
        .ok_or_else(|| error::ErrorBadRequest(format!("missing multipart field `{}`", UPLOAD_FIELD)))
}

/// `<scheme>://<host>/` as seen by the client.
fn request_base_url(req: &HttpRequest) -> String {
    let info = req.connection_info();
    format!("{}://{}/", info.scheme(), info.host())
}
