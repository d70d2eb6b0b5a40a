use std::sync::Arc;

use authority_cache::{AuthorityCache, CloudInstance, CloudInstanceTable, Environment, OAuthError};
use serde_json::{Value, json};
use tokio::sync::Barrier;
use url::Url;

fn url(value: &str) -> Url {
    Url::parse(value).unwrap()
}

fn public_cloud_metadata() -> Vec<Value> {
    vec![json!({
        "preferred_network": "login.microsoftonline.com",
        "preferred_cache": "login.windows.net",
        "aliases": ["login.microsoftonline.com", "sts.windows.net"]
    })]
}

fn public_cloud_endpoint() -> Url {
    url("https://login.microsoftonline.com/common/v2.0/.well-known/openid-configuration")
}

fn contoso_metadata() -> Vec<Value> {
    vec![json!({
        "preferred_network": "login.contoso.com",
        "preferred_cache": "cache.contoso.com",
        "aliases": ["login.contoso.com", "cache.contoso.com", "sts.contoso.com"]
    })]
}

fn contoso_endpoint() -> Url {
    url("https://login.contoso.com/tenant/v2.0/.well-known/openid-configuration")
}

#[tokio::test]
async fn metadata_for_sts_authority_resolves_to_preferred_hosts() {
    let cache = AuthorityCache::default();
    let authority = url("https://sts.windows.net/common");

    cache
        .process_metadata(&public_cloud_metadata(), &public_cloud_endpoint(), &authority)
        .await
        .unwrap();

    let aliases: Vec<String> = cache
        .cache_aliases_for_authority(&authority)
        .await
        .into_iter()
        .map(String::from)
        .collect();
    assert_eq!(
        aliases,
        [
            "https://sts.windows.net/common",
            "https://login.microsoftonline.com/common"
        ]
    );
    assert_eq!(
        cache.network_url_for_authority(&authority).await.as_str(),
        "https://login.microsoftonline.com/common"
    );
    assert_eq!(
        cache.cache_url_for_authority(&authority).await.as_str(),
        "https://login.windows.net/common"
    );
}

#[tokio::test]
async fn processing_the_same_metadata_twice_is_idempotent() {
    let cache = AuthorityCache::default();
    let authority = url("https://login.contoso.com/tenant");

    cache
        .process_metadata(&contoso_metadata(), &contoso_endpoint(), &authority)
        .await
        .unwrap();
    let first = cache.cache_aliases_for_authority(&authority).await;
    let first_record = cache.record_for_authority(&authority).await.unwrap();

    cache
        .process_metadata(&contoso_metadata(), &contoso_endpoint(), &authority)
        .await
        .unwrap();
    let second = cache.cache_aliases_for_authority(&authority).await;
    let second_record = cache.record_for_authority(&authority).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(second.len(), 3);
    assert_eq!(first_record.network_host(), second_record.network_host());
    assert_eq!(first_record.cache_host(), second_record.cache_host());
    assert_eq!(first_record.aliases(), second_record.aliases());
}

#[tokio::test]
async fn aliases_of_one_document_are_symmetric() {
    let cache = AuthorityCache::default();
    cache
        .process_metadata(
            &contoso_metadata(),
            &contoso_endpoint(),
            &url("https://login.contoso.com/tenant"),
        )
        .await
        .unwrap();

    let hosts = ["login.contoso.com", "cache.contoso.com", "sts.contoso.com"];
    for h1 in hosts {
        let authority = url(&format!("https://{h1}/tenant"));
        let aliases = cache.cache_aliases_for_authority(&authority).await;
        let record = cache.record_for_authority(&authority).await.unwrap();
        assert_eq!(record.network_host().as_str(), "login.contoso.com");
        assert_eq!(record.cache_host().as_str(), "cache.contoso.com");
        for h2 in hosts {
            let expected = url(&format!("https://{h2}/tenant"));
            assert!(
                aliases.contains(&expected),
                "aliases of {h1} should contain {h2}: {aliases:?}"
            );
        }
    }
}

#[tokio::test]
async fn unknown_authorities_are_returned_unchanged() {
    let cache = AuthorityCache::default();
    for value in [
        "https://login.fabrikam.com/tenant",
        "https://login.fabrikam.com:8443/tenant/oauth2/v2.0/token?x=1",
        "https://LOGIN.FABRIKAM.COM/Tenant",
    ] {
        let authority = url(value);
        assert_eq!(cache.network_url_for_authority(&authority).await, authority);
        assert_eq!(cache.cache_url_for_authority(&authority).await, authority);
        assert_eq!(
            cache.cache_aliases_for_authority(&authority).await,
            [authority.clone()]
        );
    }
    assert_eq!(
        cache.cache_aliases_for_environment("login.fabrikam.com").await,
        ["login.fabrikam.com"]
    );
    assert_eq!(
        cache.cache_environment_for_environment("not a host").await,
        "not a host"
    );
}

#[tokio::test]
async fn queried_authority_is_always_first() {
    let cache = AuthorityCache::default();
    cache
        .process_metadata(
            &contoso_metadata(),
            &contoso_endpoint(),
            &url("https://login.contoso.com/tenant"),
        )
        .await
        .unwrap();

    for value in [
        "https://sts.contoso.com/tenant",
        "https://cache.contoso.com/other",
        "https://login.microsoft.com/common",
        "https://login.unknown.com/common",
    ] {
        let authority = url(value);
        let aliases = cache.cache_aliases_for_authority(&authority).await;
        assert_eq!(aliases.first(), Some(&authority));
    }
}

#[tokio::test]
async fn invalid_record_takes_precedence_over_valid_record() {
    let cache = AuthorityCache::default();
    let authority = url("https://login.microsoftonline.com/contoso.onmicrosoft.com");
    assert!(cache.record_for_authority(&authority).await.is_some());

    cache
        .add_invalid_record(
            &authority,
            OAuthError::new("invalid_instance", "AADSTS50049: Unknown or invalid instance."),
        )
        .await;

    // 大文字小文字とテナント以降のパスは区別しない
    let lookup = url("https://LOGIN.microsoftonline.com/Contoso.onmicrosoft.com/oauth2/v2.0/token");
    let invalid = cache.invalid_record_for_authority(&lookup).await.unwrap();
    assert_eq!(invalid.error.code, "invalid_instance");
    assert!(
        cache
            .invalid_record_for_authority(&url("https://login.microsoftonline.com/common"))
            .await
            .is_none()
    );

    cache
        .add_invalid_record(&authority, OAuthError::new("invalid_request", ""))
        .await;
    let invalid = cache.invalid_record_for_authority(&authority).await.unwrap();
    assert_eq!(invalid.error.code, "invalid_request");

    // 解決は引き続き成功する
    assert_eq!(
        cache.network_url_for_authority(&authority).await.as_str(),
        "https://login.microsoftonline.com/contoso.onmicrosoft.com"
    );
}

#[tokio::test]
async fn merged_aliases_keep_first_occurrence() {
    let cache = AuthorityCache::default();
    let authorities = [
        url("https://login.microsoftonline.com/common"),
        url("https://sts.windows.net/common"),
        url("https://login.fabrikam.com/common"),
    ];

    let merged = cache.cache_aliases_for_authorities(&authorities).await;
    let merged: Vec<&str> = merged.iter().map(Url::as_str).collect();
    assert_eq!(
        merged,
        [
            "https://login.microsoftonline.com/common",
            "https://login.windows.net/common",
            "https://login.microsoft.com/common",
            "https://sts.windows.net/common",
            "https://login.fabrikam.com/common",
        ]
    );
}

#[tokio::test]
async fn extra_cloud_instances_are_loaded_at_construction() {
    let env = |value: &str| Environment::parse(value).unwrap();
    let table = CloudInstanceTable::with_instances([CloudInstance::new(
        "contoso",
        env("login.contoso.com"),
        env("cache.contoso.com"),
        vec![env("login.contoso.com"), env("cache.contoso.com")],
    )]);
    let cache = AuthorityCache::new(table);

    assert_eq!(
        cache.cache_environment_for_environment("LOGIN.contoso.com").await,
        "cache.contoso.com"
    );
    assert_eq!(
        cache
            .cache_url_for_authority(&url("https://login.contoso.com/tenant"))
            .await
            .as_str(),
        "https://cache.contoso.com/tenant"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_disjoint_documents_are_both_visible() {
    let cache = Arc::new(AuthorityCache::default());
    let barrier = Arc::new(Barrier::new(3));

    let documents = [
        (contoso_metadata(), contoso_endpoint(), url("https://login.contoso.com/tenant")),
        (
            vec![json!({
                "preferred_network": "login.fabrikam.com",
                "aliases": ["login.fabrikam.com", "sts.fabrikam.com"]
            })],
            url("https://login.fabrikam.com/tenant/v2.0/.well-known/openid-configuration"),
            url("https://login.fabrikam.com/tenant"),
        ),
    ];

    let mut writers = Vec::new();
    for (metadata, endpoint, authority) in documents {
        let cache = Arc::clone(&cache);
        let barrier = Arc::clone(&barrier);
        writers.push(tokio::spawn(async move {
            barrier.wait().await;
            cache
                .process_metadata(&metadata, &endpoint, &authority)
                .await
                .unwrap();
        }));
    }
    barrier.wait().await;
    for writer in writers {
        writer.await.unwrap();
    }

    for (host, expected) in [
        ("login.contoso.com", 3),
        ("cache.contoso.com", 3),
        ("sts.contoso.com", 3),
        ("login.fabrikam.com", 2),
        ("sts.fabrikam.com", 2),
    ] {
        let aliases = cache.cache_aliases_for_environment(host).await;
        assert_eq!(aliases.len(), expected, "{host}: {aliases:?}");
        assert_eq!(aliases[0], host);
    }
}
