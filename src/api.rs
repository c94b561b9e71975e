use actix_web::{get, web, Responder};

use crate::pipeline::Edge;

pub mod queue;
pub mod trigger;

#[get("/pipeline")]
async fn topology(edges: web::Data<Vec<Edge>>) -> impl Responder {
    web::Json(edges.get_ref().clone())
}

/// Registers every admin route. Expects `Data<Broker>`, `Data<Triggers>` and
/// `Data<Vec<Edge>>` in app data.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(queue::service()).service(topology);
    trigger::configure(cfg);
}
