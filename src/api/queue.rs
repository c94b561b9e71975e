use actix_web::{get, post, web, HttpResponse, Responder, Scope};
use serde::{Deserialize, Serialize};

use crate::{
    broker::Broker,
    db::queue::QueueStatistics,
    error::Error,
    message::{JobId, JobState, JobSummary},
};

#[derive(Serialize, Deserialize)]
pub struct ListQueuesResponse {
    pub queues: Vec<QueueStatistics>,
}

#[get("")]
async fn list_queues(broker: web::Data<Broker>) -> Result<impl Responder, Error> {
    let queues = broker.statistics().await?;

    Ok(web::Json(ListQueuesResponse { queues }))
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    state: Option<JobState>,
    limit: Option<u32>,
}

#[derive(Serialize, Deserialize)]
pub struct ListJobsResponse {
    pub jobs: Vec<JobSummary>,
}

#[get("/{queue_name}/jobs")]
async fn list_jobs(
    broker: web::Data<Broker>,
    path: web::Path<String>,
    query: web::Query<ListJobsQuery>,
) -> Result<impl Responder, Error> {
    let state = query.state.unwrap_or(JobState::Failed);
    let limit = match query.limit {
        None => 50,
        Some(limit @ 1..=1_000) => limit,
        Some(limit) => {
            return Err(Error::invalid_parameter(format!(
                "limit must be between 1 and 1000, got {limit}"
            )))
        }
    };

    let jobs = broker.jobs(&*path, state, limit).await?;

    Ok(web::Json(ListJobsResponse { jobs }))
}

#[get("/{queue_name}/jobs/{job_id}")]
async fn get_job(
    broker: web::Data<Broker>,
    path: web::Path<(String, JobId)>,
) -> Result<impl Responder, Error> {
    let (queue, job_id) = &*path;

    Ok(web::Json(broker.job(queue, *job_id).await?))
}

#[post("/{queue_name}/jobs/{job_id}/replay")]
async fn replay_job(
    broker: web::Data<Broker>,
    path: web::Path<(String, JobId)>,
) -> Result<impl Responder, Error> {
    let (queue, job_id) = &*path;

    broker.replay(queue, *job_id).await?;

    Ok(HttpResponse::Accepted().finish())
}

pub fn service() -> Scope {
    web::scope("/queues")
        .service(list_queues)
        .service(list_jobs)
        .service(get_job)
        .service(replay_job)
}
