mod http_stub;

use std::time::Duration;

use http_stub::{HttpStub, responses_body};
use lessonsync::error::StepError;
use lessonsync::extraction::{self, ExtractionService, OpenAiExtractor};
use lessonsync::formats::{LedgerRow, RawLesson};
use lessonsync::ledger::{LedgerClient, SheetsLedger};
use lessonsync::links::{HttpLinkChecker, LinkChecker};
use lessonsync::notify::{NotificationSink, TelegramNotifier};
use lessonsync::retry::{RateLimitBackoff, RetryPolicy};

fn sheets_row() -> LedgerRow {
    LedgerRow {
        class_id: "11005".to_owned(),
        class_code: "KG1R".to_owned(),
        course_name: "Kindergarten 1".to_owned(),
        lesson_number: "4".to_owned(),
        report_reference: "https://docs.google.com/document/d/abc/edit".to_owned(),
        homework: "Workbook p. 4".to_owned(),
        payload: "{}".to_owned(),
        status: "OK".to_owned(),
    }
}

#[tokio::test]
async fn sheets_ledger_reads_rows_and_skips_keyless_ones() {
    let stub = HttpStub::spawn(|req| {
        assert_eq!(req.method, "GET");
        let body = serde_json::json!({
            "range": "Report!A1:H3",
            "values": [
                ["11005", "KG1R", "Kindergarten 1", 1, "", "", "{}", "OK"],
                ["11005", "KG1R"],
                ["11005", "KG1R", "Kindergarten 1", "2"]
            ]
        });
        (200, body.to_string())
    });
    let ledger = SheetsLedger::new(&stub.base_url, "sheet-1", "Report", "sheets-token").unwrap();

    let rows = ledger.fetch_rows().await.unwrap();

    let numbers: Vec<_> = rows.iter().map(|r| r.lesson_number.as_str()).collect();
    assert_eq!(numbers, ["1", "2"]);
    let requests = stub.requests();
    assert_eq!(requests[0].url, "/v4/spreadsheets/sheet-1/values/Report");
    assert_eq!(requests[0].authorization.as_deref(), Some("Bearer sheets-token"));
}

#[tokio::test]
async fn sheets_ledger_appends_one_row_in_column_order() {
    let stub = HttpStub::spawn(|_| (200, "{}".to_owned()));
    let ledger = SheetsLedger::new(&stub.base_url, "sheet-1", "Report", "sheets-token").unwrap();

    ledger.append_row(&sheets_row()).await.unwrap();

    let requests = stub.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "POST");
    assert!(
        requests[0]
            .url
            .starts_with("/v4/spreadsheets/sheet-1/values/Report:append?"),
        "{}",
        requests[0].url
    );
    let body: serde_json::Value = serde_json::from_str(&requests[0].body).unwrap();
    assert_eq!(body["values"][0][0], "11005");
    assert_eq!(body["values"][0][3], "4");
    assert_eq!(body["values"][0][7], "OK");
}

#[tokio::test]
async fn sheets_errors_are_classified() {
    let unavailable = HttpStub::spawn(|_| (503, "{}".to_owned()));
    let ledger = SheetsLedger::new(&unavailable.base_url, "s", "Report", "t").unwrap();
    let err = ledger.fetch_rows().await.unwrap_err();
    assert!(err.is_retryable(), "{err}");

    let forbidden = HttpStub::spawn(|_| (403, r#"{"error":"denied"}"#.to_owned()));
    let ledger = SheetsLedger::new(&forbidden.base_url, "s", "Report", "t").unwrap();
    let err = ledger.append_row(&sheets_row()).await.unwrap_err();
    assert!(!err.is_retryable(), "{err}");
}

#[tokio::test]
async fn openai_rate_limit_falls_back_to_next_model() {
    let stub = HttpStub::spawn(|req| {
        let parsed: serde_json::Value = serde_json::from_str(&req.body).unwrap();
        match parsed["model"].as_str() {
            Some("primary-model") => (
                429,
                r#"{"error":{"message":"Rate limit reached","code":"rate_limit_exceeded"}}"#
                    .to_owned(),
            ),
            _ => (
                200,
                responses_body("```json\n{\"lesson_unit\": \"Unit 33 (1st)\", \"links_all\": []}\n```"),
            ),
        }
    });
    let extractor = OpenAiExtractor::new(
        &format!("{}/v1", stub.base_url),
        "sk-test",
        vec!["primary-model".to_owned(), "fallback-model".to_owned()],
        0.0,
    )
    .unwrap();
    let backoff = RateLimitBackoff {
        base: Duration::ZERO,
        max: Duration::ZERO,
        max_jitter: Duration::ZERO,
    };

    let policy = RetryPolicy::new(3, Duration::ZERO);

    let out = extraction::extract_with_fallback(
        &extractor,
        &policy,
        &backoff,
        "11005:33",
        "Unit 33 lesson plan",
    )
    .await;

    assert!(!out.degraded);
    assert_eq!(out.backend.as_deref(), Some("fallback-model"));
    assert_eq!(out.payload["lesson_unit"], "Unit 33 (1st)");
    let requests = stub.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|r| r.url == "/v1/responses"));
    assert_eq!(requests[0].authorization.as_deref(), Some("Bearer sk-test"));
}

#[tokio::test]
async fn openai_quota_error_is_rate_limited() {
    let stub = HttpStub::spawn(|_| {
        (
            400,
            r#"{"error":{"message":"You exceeded your current quota","code":"insufficient_quota"}}"#
                .to_owned(),
        )
    });
    let extractor = OpenAiExtractor::new(
        &format!("{}/v1", stub.base_url),
        "sk-test",
        vec!["only-model".to_owned()],
        0.0,
    )
    .unwrap();

    let err = extractor.extract("only-model", "text").await.unwrap_err();
    assert!(matches!(err, StepError::RateLimited(_)), "{err}");
}

#[tokio::test]
async fn openai_non_json_output_is_an_extraction_failure() {
    let stub = HttpStub::spawn(|_| (200, responses_body("Sorry, I cannot help with that.")));
    let extractor = OpenAiExtractor::new(
        &format!("{}/v1", stub.base_url),
        "sk-test",
        vec!["only-model".to_owned()],
        0.0,
    )
    .unwrap();

    let err = extractor.extract("only-model", "text").await.unwrap_err();
    assert!(!err.is_rate_limited());
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn telegram_notifier_posts_html_message() {
    let stub = HttpStub::spawn(|_| (200, r#"{"ok":true}"#.to_owned()));
    let notifier = TelegramNotifier::new(&stub.base_url, "123:abc", "-10042").unwrap();

    notifier.send("<b>done</b>").await.unwrap();

    let requests = stub.requests();
    assert_eq!(requests[0].url, "/bot123:abc/sendMessage");
    let body: serde_json::Value = serde_json::from_str(&requests[0].body).unwrap();
    assert_eq!(body["chat_id"], "-10042");
    assert_eq!(body["parse_mode"], "HTML");
    assert_eq!(body["text"], "<b>done</b>");
}

#[tokio::test]
async fn telegram_error_status_is_reported() {
    let stub = HttpStub::spawn(|_| (401, r#"{"ok":false}"#.to_owned()));
    let notifier = TelegramNotifier::new(&stub.base_url, "bad", "1").unwrap();
    let err = notifier.send("hi").await.unwrap_err();
    assert!(err.to_string().contains("401"), "{err}");
}

#[tokio::test]
async fn link_checker_heads_report_export_and_homework_links() {
    let stub = HttpStub::spawn(|req| {
        assert_eq!(req.method, "HEAD");
        if req.url.starts_with("/document/d/gone/") || req.url == "/dead" {
            (404, String::new())
        } else {
            (200, String::new())
        }
    });
    let checker = HttpLinkChecker::new(&stub.base_url).unwrap();

    let healthy = RawLesson {
        report_reference: Some("https://docs.google.com/document/d/live/edit".to_owned()),
        homework: String::new(),
        report_text: String::new(),
        links: vec![
            format!("{}/ok", stub.base_url),
            "https://drive.google.com/file/d/private/view".to_owned(),
        ],
    };
    assert!(checker.audit(&healthy).await.is_empty());

    let broken = RawLesson {
        report_reference: Some("https://docs.google.com/document/d/gone/edit".to_owned()),
        links: vec![format!("{}/dead", stub.base_url)],
        ..healthy
    };
    let problems = checker.audit(&broken).await;
    assert_eq!(problems.len(), 2, "{problems:?}");
    assert!(problems[0].contains("deleted or not found"), "{problems:?}");
    assert!(problems[1].contains("HTTP 404"), "{problems:?}");

    let urls: Vec<_> = stub.requests().into_iter().map(|r| r.url).collect();
    assert!(urls.contains(&"/document/d/live/export?format=pdf".to_owned()), "{urls:?}");
    assert!(!urls.iter().any(|u| u.contains("private")), "{urls:?}");
}
