use certdeploy_lib::{CancellationToken, DeployConfig, DeployError, JobState, ProviderRegistry};
use serde_json::{Value, json};
use wiremock::matchers::{body_partial_json, header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::test_utils::{KEY_PEM, self_signed};

fn config(server: &MockServer, extra: Value) -> DeployConfig {
    let mut raw = json!({
        "provider": "tencentcloud-ssl",
        "base_url": server.uri(),
        "poll_interval_secs": 0,
        "credentials": { "secret_id": "AKIDexample", "secret_key": "secret" }
    });
    if let (Some(raw), Value::Object(extra)) = (raw.as_object_mut(), extra) {
        raw.extend(extra);
    }
    DeployConfig::from_json(&raw.to_string()).unwrap()
}

fn api(action: &str) -> wiremock::MockBuilder {
    Mock::given(method("POST"))
        .and(path("/"))
        .and(header("X-TC-Action", action))
        .and(header("X-TC-Version", "2019-12-05"))
        .and(header_exists("Authorization"))
}

fn respond(body: Value) -> ResponseTemplate {
    let mut body = body;
    if let Some(fields) = body.as_object_mut() {
        fields.insert("RequestId".into(), json!("6ef60bec-0242-43af-bb20-270359fb54a7"));
    }
    ResponseTemplate::new(200).set_body_json(json!({ "Response": body }))
}

async fn mount_empty_store(server: &MockServer) {
    api("DescribeCertificates")
        .respond_with(respond(json!({ "Certificates": [], "TotalCount": 0 })))
        .mount(server)
        .await;
}

async fn mount_upload(server: &MockServer, expected: u64) {
    api("UploadCertificate")
        .and(body_partial_json(json!({ "CertificateType": "SVR", "Repeatable": false })))
        .respond_with(respond(json!({ "CertificateId": "new-cert" })))
        .expect(expected)
        .mount(server)
        .await;
}

fn record(total: u64, succeeded: u64, failed: u64, running: u64) -> Value {
    json!({
        "TotalCount": total,
        "SuccessTotalCount": succeeded,
        "FailedTotalCount": failed,
        "RunningTotalCount": running
    })
}

#[tokio::test]
async fn replace_in_place_polls_update_record_until_done() {
    let server = MockServer::start().await;
    mount_empty_store(&server).await;
    mount_upload(&server, 1).await;
    api("UpdateCertificateInstance")
        .and(body_partial_json(json!({
            "OldCertificateId": "old-cert",
            "CertificateId": "new-cert",
            "ResourceTypes": ["cdn", "clb"],
            "ResourceTypesRegions": [
                { "ResourceType": "cdn", "Regions": ["ap-guangzhou"] },
                { "ResourceType": "clb", "Regions": ["ap-guangzhou"] }
            ]
        })))
        .respond_with(respond(json!({ "DeployRecordId": 1024, "DeployStatus": 1 })))
        .expect(1)
        .mount(&server)
        .await;
    api("DescribeHostUpdateRecordDetail")
        .and(body_partial_json(json!({ "DeployRecordId": "1024" })))
        .respond_with(respond(json!({
            "RecordDetailList": [
                { "ResourceType": "cdn", "TotalCount": 2, "SuccessTotalCount": 1, "RunningTotalCount": 1 },
                { "ResourceType": "clb", "TotalCount": 1, "RunningTotalCount": 1 }
            ]
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    api("DescribeHostUpdateRecordDetail")
        .and(body_partial_json(json!({ "DeployRecordId": "1024" })))
        .respond_with(respond(json!({
            "RecordDetailList": [
                { "ResourceType": "cdn", "TotalCount": 2, "SuccessTotalCount": 2 },
                { "ResourceType": "clb", "TotalCount": 1, "SuccessTotalCount": 1 }
            ]
        })))
        .mount(&server)
        .await;
    api("DescribeHostDeployRecordDetail")
        .respond_with(respond(record(0, 0, 0, 0)))
        .expect(0)
        .mount(&server)
        .await;

    let deployer = ProviderRegistry::with_defaults()
        .build(&config(
            &server,
            json!({
                "replace_in_place": true,
                "previous_cert_id": "old-cert",
                "resource_types": ["cdn", "clb"],
                "regions": ["ap-guangzhou"]
            }),
        ))
        .unwrap();
    let result = deployer
        .deploy(&CancellationToken::new(), &self_signed(&["www.example.com"]), KEY_PEM)
        .await
        .unwrap();

    assert_eq!(result.upload.cert_id, "new-cert");
    let summary = result.job.unwrap();
    assert_eq!(summary.job_id, "1024");
    assert_eq!(summary.state, JobState::Succeeded);
    assert_eq!((summary.succeeded, summary.total, summary.polls), (3, 3, 2));
}

#[tokio::test]
async fn rebind_reports_failed_instances() {
    let server = MockServer::start().await;
    mount_empty_store(&server).await;
    mount_upload(&server, 1).await;
    api("DeployCertificateInstance")
        .and(body_partial_json(json!({
            "CertificateId": "new-cert",
            "InstanceIdList": ["lb-1", "lb-2"],
            "ResourceType": "clb"
        })))
        .respond_with(respond(json!({ "DeployRecordId": 77, "DeployStatus": 1 })))
        .expect(1)
        .mount(&server)
        .await;
    api("DescribeHostDeployRecordDetail")
        .and(body_partial_json(json!({ "DeployRecordId": "77" })))
        .respond_with(respond(record(2, 1, 1, 0)))
        .mount(&server)
        .await;
    api("DescribeHostUpdateRecordDetail")
        .respond_with(respond(json!({ "RecordDetailList": [] })))
        .expect(0)
        .mount(&server)
        .await;

    let deployer = ProviderRegistry::with_defaults()
        .build(&config(
            &server,
            json!({ "domains": ["lb-1", "lb-2"], "resource_types": ["clb"] }),
        ))
        .unwrap();
    let err = deployer
        .deploy(&CancellationToken::new(), &self_signed(&["www.example.com"]), KEY_PEM)
        .await
        .unwrap_err();

    match err {
        DeployError::JobFailed {
            job_id,
            succeeded,
            failed,
            total,
        } => {
            assert_eq!(job_id, "77");
            assert_eq!((succeeded, failed, total), (1, 1, 2));
        }
        other => panic!("expected job failure, got {other:?}"),
    }
}

#[tokio::test]
async fn reuses_stored_certificate_with_same_content() {
    let server = MockServer::start().await;
    let pem = self_signed(&["www.example.com"]);
    api("DescribeCertificates")
        .respond_with(respond(json!({
            "Certificates": [{ "CertificateId": "existing", "Alias": "web", "Domain": "www.example.com" }],
            "TotalCount": 1
        })))
        .mount(&server)
        .await;
    api("DescribeCertificateDetail")
        .and(body_partial_json(json!({ "CertificateId": "existing" })))
        .respond_with(respond(json!({ "CertificatePublicKey": pem.replace('\n', "\r\n") })))
        .expect(1)
        .mount(&server)
        .await;
    mount_upload(&server, 0).await;
    api("DeployCertificateInstance")
        .and(body_partial_json(json!({ "CertificateId": "existing" })))
        .respond_with(respond(json!({ "DeployRecordId": 5 })))
        .mount(&server)
        .await;
    api("DescribeHostDeployRecordDetail")
        .respond_with(respond(record(1, 1, 0, 0)))
        .mount(&server)
        .await;

    let deployer = ProviderRegistry::with_defaults()
        .build(&config(
            &server,
            json!({ "domains": ["cdn-domain-1"], "resource_types": ["cdn"] }),
        ))
        .unwrap();
    let result = deployer
        .deploy(&CancellationToken::new(), &pem, KEY_PEM)
        .await
        .unwrap();

    assert_eq!(result.upload.cert_id, "existing");
    assert_eq!(result.job.unwrap().state, JobState::Succeeded);
}

#[tokio::test]
async fn rebind_without_single_resource_type_is_upstream_error() {
    let server = MockServer::start().await;
    mount_empty_store(&server).await;
    mount_upload(&server, 1).await;
    api("DeployCertificateInstance")
        .respond_with(respond(json!({ "DeployRecordId": 1 })))
        .expect(0)
        .mount(&server)
        .await;

    let deployer = ProviderRegistry::with_defaults()
        .build(&config(
            &server,
            json!({ "domains": ["lb-1"], "resource_types": ["clb", "cdn"] }),
        ))
        .unwrap();
    let err = deployer
        .deploy(&CancellationToken::new(), &self_signed(&["www.example.com"]), KEY_PEM)
        .await
        .unwrap_err();

    match err {
        DeployError::Upstream { operation, message } => {
            assert_eq!(operation, "submit deployment job");
            assert!(message.contains("exactly one resource type"));
        }
        other => panic!("expected upstream error, got {other:?}"),
    }
}

#[tokio::test]
async fn rejected_credentials_surface_as_upstream_error() {
    let server = MockServer::start().await;
    api("DescribeCertificates")
        .respond_with(respond(json!({
            "Error": {
                "Code": "AuthFailure.SecretIdNotFound",
                "Message": "The SecretId is not found, please ensure that your SecretId is correct."
            }
        })))
        .mount(&server)
        .await;
    mount_upload(&server, 0).await;

    let deployer = ProviderRegistry::with_defaults()
        .build(&config(&server, json!({ "resource_types": ["cdn"] })))
        .unwrap();
    let err = deployer
        .deploy(&CancellationToken::new(), &self_signed(&["www.example.com"]), KEY_PEM)
        .await
        .unwrap_err();

    match err {
        DeployError::Upstream { operation, message } => {
            assert_eq!(operation, "list certificates");
            assert!(message.contains("Tencent Cloud authentication failed"));
            assert!(message.contains("SecretId is not found"));
        }
        other => panic!("expected upstream error, got {other:?}"),
    }
}

#[tokio::test]
async fn replace_without_previous_identity_makes_no_calls() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let deployer = ProviderRegistry::with_defaults()
        .build(&config(
            &server,
            json!({ "replace_in_place": true, "resource_types": ["cdn"] }),
        ))
        .unwrap();
    let err = deployer
        .deploy(&CancellationToken::new(), &self_signed(&["www.example.com"]), KEY_PEM)
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::Config(_)));
}
