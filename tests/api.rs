mod common;

use actix_web::{http::StatusCode, test, web::Data, App};
use common::{reject_inserts, setup};
use sluice::{
    api::{
        self,
        queue::{ListJobsResponse, ListQueuesResponse},
        trigger::{AddTokenResponse, Triggers},
    },
    message::{JobState, JobSummary},
    payloads::{RefreshSignal, TokenPayload},
    pipeline::Edge,
    router::Topology,
};

#[actix_web::test]
async fn test_admin_surface() {
    let broker = setup().await;

    let triggers = Triggers {
        token_updates: broker.queue::<TokenPayload>("TokenUpdateInbox").await.unwrap(),
        refresh: broker.queue::<RefreshSignal>("RefreshInbox").await.unwrap(),
    };
    let edges = vec![Edge {
        from: "TokenUpdateInbox".to_owned(),
        to: vec!["DeploymentRoutingInbox".to_owned()],
        topology: Topology::Broadcast,
    }];

    let app = test::init_service(
        App::new()
            .configure(api::configure)
            .app_data(Data::new((*broker).clone()))
            .app_data(Data::new(triggers))
            .app_data(Data::new(edges.clone())),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/add-token?chainId=42161")
        .to_request();
    let res = test::call_service(&app, req).await;
    assert_eq!(res.status(), StatusCode::CREATED);
    let body: AddTokenResponse = test::read_body_json(res).await;
    assert_eq!(body.msg, "Token added to the queue");
    assert!(body.token_id.starts_with("42161-"));

    let req = test::TestRequest::get().uri("/refresh").to_request();
    let res = test::call_service(&app, req).await;
    assert_eq!(res.status(), StatusCode::CREATED);

    let req = test::TestRequest::get().uri("/queues").to_request();
    let body: ListQueuesResponse = test::call_and_read_body_json(&app, req).await;
    let names: Vec<_> = body.queues.iter().map(|queue| queue.name.as_str()).collect();
    assert_eq!(names, vec!["RefreshInbox", "TokenUpdateInbox"]);
    assert!(body.queues.iter().all(|queue| queue.waiting == 1));

    let req = test::TestRequest::get()
        .uri("/queues/TokenUpdateInbox/jobs?state=waiting")
        .to_request();
    let body: ListJobsResponse = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body.jobs.len(), 1);
    assert_eq!(body.jobs[0].state, JobState::Waiting);
    assert_eq!(body.jobs[0].name, "TokenUpdated");
    assert_eq!(
        body.jobs[0].dedup_key.as_deref(),
        body.jobs[0].payload["tokenId"].as_str()
    );

    let id = body.jobs[0].id;
    let req = test::TestRequest::get()
        .uri(&format!("/queues/TokenUpdateInbox/jobs/{id}"))
        .to_request();
    let job: JobSummary = test::call_and_read_body_json(&app, req).await;
    assert_eq!(job, body.jobs[0]);

    // Ids are scoped to their queue.
    let req = test::TestRequest::get()
        .uri(&format!("/queues/RefreshInbox/jobs/{id}"))
        .to_request();
    let res = test::call_service(&app, req).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    for limit in [0, 1_001] {
        let req = test::TestRequest::get()
            .uri(&format!("/queues/TokenUpdateInbox/jobs?state=waiting&limit={limit}"))
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    let req = test::TestRequest::get().uri("/pipeline").to_request();
    let body: Vec<Edge> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body, edges);

    let req = test::TestRequest::get()
        .uri("/queues/Missing/jobs")
        .to_request();
    let res = test::call_service(&app, req).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let req = test::TestRequest::post()
        .uri("/queues/TokenUpdateInbox/jobs/1/replay")
        .to_request();
    let res = test::call_service(&app, req).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[actix_web::test]
async fn test_add_token_reports_enqueue_failure() {
    let broker = setup().await;

    let triggers = Triggers {
        token_updates: broker.queue::<TokenPayload>("TokenUpdateInbox").await.unwrap(),
        refresh: broker.queue::<RefreshSignal>("RefreshInbox").await.unwrap(),
    };
    reject_inserts(&broker, "TokenUpdateInbox").await;

    let app = test::init_service(
        App::new()
            .configure(api::configure)
            .app_data(Data::new((*broker).clone()))
            .app_data(Data::new(triggers))
            .app_data(Data::new(Vec::<Edge>::new())),
    )
    .await;

    let req = test::TestRequest::post().uri("/add-token").to_request();
    let res = test::call_service(&app, req).await;
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let counts = broker.counts("TokenUpdateInbox").await.unwrap();
    assert_eq!(counts.waiting, 0);
}
