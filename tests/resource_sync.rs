use std::sync::{Arc, Mutex};

use rescore::resource::{
    BoxError, CachedResource, FnLoader, LoadFailure, ResourceAlias, ResourceAliases,
    ResourceConfig, ResourceError, ResourceKey,
};

type Comments = CachedResource<(u32, u32), String>;

const BY_POST: ResourceAlias = ResourceAlias::new("by_post");

fn users() -> CachedResource<u32, String> {
    CachedResource::with_loader(
        "users",
        FnLoader::new(|keys: Vec<u32>| async move {
            Ok::<_, BoxError>(
                keys.into_iter()
                    .map(|key| (key, format!("user-{key}")))
                    .collect(),
            )
        }),
    )
}

fn profiles() -> CachedResource<u32, String> {
    CachedResource::with_loader(
        "profiles",
        FnLoader::new(|keys: Vec<u32>| async move {
            Ok::<_, BoxError>(
                keys.into_iter()
                    .map(|key| (key, format!("profile-{key}")))
                    .collect(),
            )
        }),
    )
}

fn comments() -> Comments {
    let aliases = ResourceAliases::new().add(BY_POST.name(), |alias: &ResourceAlias| {
        let post: u32 = alias.param().and_then(|p| p.parse().ok()).unwrap_or_default();
        ResourceKey::list((0..3).map(move |comment| (post, comment)))
    });
    CachedResource::new(
        "comments",
        FnLoader::new(|keys: Vec<(u32, u32)>| async move {
            Ok::<_, BoxError>(
                keys.into_iter()
                    .map(|(post, comment)| ((post, comment), format!("comment-{post}-{comment}")))
                    .collect(),
            )
        }),
        aliases,
        ResourceConfig::default(),
    )
}

#[tokio::test]
async fn dependency_update_and_delete_propagate() {
    let users = users();
    let profiles = profiles();
    profiles.sync(users.events());

    users.load(vec![1, 2]).await.expect("users load");
    profiles.load(vec![1, 2]).await.expect("profiles load");

    users.set(1, "user-1-renamed".to_string()).await;
    assert!(profiles.is_outdated(&1));
    assert!(!profiles.is_outdated(&2));
    assert_eq!(profiles.get(&1).as_deref(), Some("profile-1"));

    users.delete(2_u32).await.expect("delete");
    assert_eq!(profiles.get(&2), None);
    assert!(!profiles.is_loaded(&2));
}

#[tokio::test]
async fn dependency_events_skip_unknown_keys() {
    let users = users();
    let profiles = profiles();
    profiles.sync(users.events());

    let fired = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&fired);
    profiles
        .events()
        .on_data_outdated
        .add_handler(move |keys: Vec<u32>, _| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().unwrap().push(keys);
            }
        });

    users.load(vec![7]).await.expect("users load");
    users.set(7, "user-7-renamed".to_string()).await;

    assert!(fired.lock().unwrap().is_empty());
    assert!(!profiles.is_loaded(&7));
}

#[tokio::test]
async fn detached_links_stop_propagation() {
    let users = users();
    let profiles = profiles();
    let links = profiles.sync(users.events());

    users.load(3_u32).await.expect("users load");
    profiles.load(3_u32).await.expect("profiles load");

    links.detach(users.events());
    users.set(3, "user-3-renamed".to_string()).await;

    assert_eq!(users.get(&3).as_deref(), Some("user-3-renamed"));
    assert!(!profiles.is_outdated(&3));
}

#[tokio::test]
async fn mapped_dependency_outdates_children_through_alias() {
    let posts = users();
    let comments = comments();
    comments.sync_with(
        posts.events(),
        |keys: &[u32]| match keys {
            [post] => ResourceKey::alias(BY_POST.with_param(post.to_string())),
            _ => ResourceKey::list(keys.iter().flat_map(|post| (0..3).map(move |c| (*post, c)))),
        },
        |keys: &[u32]| ResourceKey::list(keys.iter().flat_map(|post| (0..3).map(move |c| (*post, c)))),
    );

    posts.load(vec![1, 2]).await.expect("posts load");
    let loaded = comments
        .load(ResourceKey::alias(BY_POST.with_param("1")))
        .await
        .expect("comments load");
    assert_eq!(loaded.len(), 3);
    comments.load((2_u32, 0_u32)).await.expect("single comment");

    posts.refresh(1_u32).await.expect("refresh post");
    assert!(comments.is_outdated(&(1, 0)));
    assert!(comments.is_outdated(&(1, 2)));
    assert!(!comments.is_outdated(&(2, 0)));

    posts.delete(2_u32).await.expect("delete post");
    assert_eq!(comments.get(&(2, 0)), None);
    assert_eq!(comments.len(), 3);
}

#[tokio::test]
async fn load_failure_reaches_error_subscribers() {
    let flaky: CachedResource<u32, String> = CachedResource::with_loader(
        "flaky",
        FnLoader::new(|_keys: Vec<u32>| async move {
            Err::<Vec<(u32, String)>, BoxError>("backend unavailable".into())
        }),
    );

    let failures: Arc<Mutex<Vec<LoadFailure<u32>>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&failures);
    flaky
        .events()
        .on_data_error
        .add_handler(move |failure: LoadFailure<u32>, _| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().unwrap().push(failure);
            }
        });

    let err = flaky.load(vec![4, 5]).await.expect_err("load fails");
    assert!(matches!(err, ResourceError::Load { .. }));
    assert!(flaky.is_error(&4));

    let failures = failures.lock().unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].keys, vec![4, 5]);
}
