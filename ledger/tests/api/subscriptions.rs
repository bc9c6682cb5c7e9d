use jiff::SignedDuration;
use ledger::store::{StoreError, TransferDenied, subscription};
use payloads::{
    ParticipantStatus, ProductId, ProductOptionId, ProductPermission,
    SubscriptionStatus, TransactionCategory, requests::Subscribe,
};
use test_helpers::{TestApp, spawn_app};
use uuid::Uuid;

use crate::{Shop, get_subscription, setup_shop, subscription_rows};

const DAYS: i32 = 30;
const PERIOD: SignedDuration = SignedDuration::from_hours(24 * DAYS as i64);

fn plain(product_id: ProductId) -> Subscribe {
    Subscribe {
        product_id,
        option_id: None,
        coupon_code: None,
    }
}

async fn subscribe(
    app: &TestApp,
    shop: &Shop,
    request: &Subscribe,
) -> Result<payloads::responses::Purchase, StoreError> {
    subscription::subscribe(
        &shop.buyer.user_id,
        request,
        &app.time_source,
        &app.db_pool,
    )
    .await
}

async fn key_count(app: &TestApp, shop: &Shop) -> anyhow::Result<usize> {
    let key = ProductPermission(shop.product_id).key();
    Ok(app
        .permissions(&shop.buyer.user_id)
        .await?
        .iter()
        .filter(|p| **p == key)
        .count())
}

#[tokio::test]
async fn subscribe_charges_buyer_and_grants_access() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let shop = setup_shop(&app, 100, DAYS, 250).await?;
    let now = app.time_source.now();

    let purchase = subscribe(&app, &shop, &plain(shop.product_id)).await?;

    assert!(!purchase.renewed);
    assert_eq!(purchase.price, 100);
    assert_eq!(purchase.discount, 0);
    let sub = &purchase.subscription;
    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert_eq!(sub.league_id, shop.league_id);
    assert_eq!(sub.started_at, now);
    assert_eq!(sub.expires_at, now + PERIOD);

    let tx = purchase.transaction.expect("paid purchase has a transaction");
    assert_eq!(sub.transaction_id, Some(tx.id));
    assert_eq!(tx.category, TransactionCategory::Purchase);
    assert_eq!(tx.from_account_id, shop.buyer.account_id);
    assert_eq!(tx.to_account_id, shop.seller.account_id);
    assert_eq!(tx.description.as_deref(), Some("Subscription: Match Analytics"));

    assert_eq!(app.balance(&shop.buyer.account_id).await?, 150);
    assert_eq!(app.balance(&shop.seller.account_id).await?, 100);
    assert_eq!(key_count(&app, &shop).await?, 1);
    assert!(
        subscription::check_access(
            &shop.buyer.user_id,
            &shop.product_id,
            &app.db_pool
        )
        .await?
    );
    assert!(
        !subscription::check_access(
            &shop.seller.user_id,
            &shop.product_id,
            &app.db_pool
        )
        .await?
    );

    Ok(())
}

#[tokio::test]
async fn renew_extends_the_same_row() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let shop = setup_shop(&app, 100, DAYS, 1000).await?;

    let first = subscribe(&app, &shop, &plain(shop.product_id)).await?;
    app.time_source.advance(SignedDuration::from_hours(24 * 10));

    let renewed = subscription::renew(
        &shop.buyer.user_id,
        &first.subscription.id,
        None,
        &app.time_source,
        &app.db_pool,
    )
    .await?;

    assert!(renewed.renewed);
    assert_eq!(renewed.subscription.id, first.subscription.id);
    assert_eq!(
        renewed.subscription.expires_at,
        first.subscription.expires_at + PERIOD
    );
    assert_eq!(
        renewed.subscription.transaction_id,
        renewed.transaction.as_ref().map(|t| t.id)
    );
    assert_ne!(
        renewed.subscription.transaction_id,
        first.subscription.transaction_id
    );

    // Subscribing again while active extends the same row too.
    let again = subscribe(&app, &shop, &plain(shop.product_id)).await?;
    assert!(again.renewed);
    assert_eq!(
        again.subscription.expires_at,
        first.subscription.expires_at + PERIOD + PERIOD
    );

    let rows = subscription_rows(&app, &shop).await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(key_count(&app, &shop).await?, 1);
    assert_eq!(app.balance(&shop.buyer.account_id).await?, 700);

    Ok(())
}

#[tokio::test]
async fn overdue_renewal_extends_from_previous_expiry() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let shop = setup_shop(&app, 100, DAYS, 1000).await?;

    let first = subscribe(&app, &shop, &plain(shop.product_id)).await?;
    // Past expiry, but the sweep hasn't run yet.
    app.time_source.advance(PERIOD + SignedDuration::from_hours(24 * 5));

    let renewed = subscription::renew(
        &shop.buyer.user_id,
        &first.subscription.id,
        None,
        &app.time_source,
        &app.db_pool,
    )
    .await?;
    assert!(renewed.renewed);
    assert_eq!(renewed.subscription.id, first.subscription.id);
    assert_eq!(
        renewed.subscription.expires_at,
        first.subscription.expires_at + PERIOD
    );

    Ok(())
}

#[tokio::test]
async fn renewal_does_not_restore_a_removed_key() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let shop = setup_shop(&app, 100, DAYS, 1000).await?;
    subscribe(&app, &shop, &plain(shop.product_id)).await?;

    let key = ProductPermission(shop.product_id).key();
    sqlx::query(
        "UPDATE users SET permissions = array_remove(permissions, $2) WHERE id = $1",
    )
    .bind(shop.buyer.user_id)
    .bind(&key)
    .execute(&app.db_pool)
    .await?;

    let renewed = subscribe(&app, &shop, &plain(shop.product_id)).await?;
    assert!(renewed.renewed);
    assert_eq!(key_count(&app, &shop).await?, 0);

    // The active row still answers access checks.
    assert!(
        subscription::check_access(
            &shop.buyer.user_id,
            &shop.product_id,
            &app.db_pool
        )
        .await?
    );

    Ok(())
}

#[tokio::test]
async fn unrepresentable_expiry_is_an_error() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let shop = setup_shop(&app, 100, 3_000_000, 1000).await?;

    let result = subscribe(&app, &shop, &plain(shop.product_id)).await;

    assert!(matches!(result, Err(StoreError::UnexpectedError(_))));
    assert_eq!(app.balance(&shop.buyer.account_id).await?, 1000);
    assert!(subscription_rows(&app, &shop).await?.is_empty());
    assert_eq!(key_count(&app, &shop).await?, 0);

    Ok(())
}

#[tokio::test]
async fn insufficient_balance_writes_nothing() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let shop = setup_shop(&app, 100, DAYS, 50).await?;
    let count = app.transaction_count(&shop.league_id).await?;

    let result = subscribe(&app, &shop, &plain(shop.product_id)).await;

    assert!(matches!(result, Err(StoreError::InsufficientBalance)));
    assert_eq!(app.balance(&shop.buyer.account_id).await?, 50);
    assert_eq!(app.balance(&shop.seller.account_id).await?, 0);
    assert_eq!(app.transaction_count(&shop.league_id).await?, count);
    assert!(subscription_rows(&app, &shop).await?.is_empty());
    assert_eq!(key_count(&app, &shop).await?, 0);

    Ok(())
}

#[tokio::test]
async fn option_price_is_added_and_remembered() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let shop = setup_shop(&app, 100, DAYS, 1000).await?;
    let premium = app
        .create_product_option(&shop.product_id, "Premium", 50)
        .await?;

    let purchase = subscribe(
        &app,
        &shop,
        &Subscribe {
            product_id: shop.product_id,
            option_id: Some(premium),
            coupon_code: None,
        },
    )
    .await?;
    assert_eq!(purchase.price, 150);
    assert_eq!(purchase.subscription.option_id, Some(premium));

    // Renewal defaults to the recorded option.
    let renewed = subscription::renew(
        &shop.buyer.user_id,
        &purchase.subscription.id,
        None,
        &app.time_source,
        &app.db_pool,
    )
    .await?;
    assert_eq!(renewed.price, 150);

    // Unknown options and options of other products are rejected.
    let other = app
        .create_product(&shop.league_id, &shop.seller.user_id, "Other", 10, 7)
        .await?;
    let foreign = app.create_product_option(&other, "Gold", 5).await?;
    for option_id in [foreign, ProductOptionId(Uuid::new_v4())] {
        let result = subscription::renew(
            &shop.buyer.user_id,
            &purchase.subscription.id,
            Some(option_id),
            &app.time_source,
            &app.db_pool,
        )
        .await;
        assert!(matches!(result, Err(StoreError::UnknownOption)));
    }

    assert_eq!(app.balance(&shop.buyer.account_id).await?, 700);

    Ok(())
}

#[tokio::test]
async fn product_must_be_an_active_subscription() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let shop = setup_shop(&app, 100, DAYS, 1000).await?;

    let missing = subscribe(&app, &shop, &plain(ProductId(Uuid::new_v4()))).await;
    assert!(matches!(missing, Err(StoreError::ProductNotFound)));

    let one_off = app
        .create_product(&shop.league_id, &shop.seller.user_id, "Jersey", 40, 0)
        .await?;
    let result = subscribe(&app, &shop, &plain(one_off)).await;
    assert!(matches!(result, Err(StoreError::NotASubscriptionProduct)));

    app.deactivate_product(&shop.product_id).await?;
    let result = subscribe(&app, &shop, &plain(shop.product_id)).await;
    assert!(matches!(result, Err(StoreError::ProductInactive)));

    assert_eq!(app.balance(&shop.buyer.account_id).await?, 1000);

    Ok(())
}

#[tokio::test]
async fn buyer_must_be_approved_and_seller_a_participant() -> anyhow::Result<()>
{
    let app = spawn_app().await;
    let shop = setup_shop(&app, 100, DAYS, 1000).await?;

    let pending = app.create_user("pending").await?;
    app.create_participant(
        &shop.league_id,
        &pending,
        "Pending",
        ParticipantStatus::Pending,
    )
    .await?;
    let result = subscription::subscribe(
        &pending,
        &plain(shop.product_id),
        &app.time_source,
        &app.db_pool,
    )
    .await;
    assert!(matches!(
        result,
        Err(StoreError::Forbidden(TransferDenied::NotApproved))
    ));

    let stranger = app.create_user("stranger").await?;
    let result = subscription::subscribe(
        &stranger,
        &plain(shop.product_id),
        &app.time_source,
        &app.db_pool,
    )
    .await;
    assert!(matches!(result, Err(StoreError::ParticipantNotFound)));

    let outside_seller = app.create_user("outside").await?;
    let orphan = app
        .create_product(&shop.league_id, &outside_seller, "Orphan", 10, DAYS)
        .await?;
    let result = subscribe(&app, &shop, &plain(orphan)).await;
    assert!(matches!(result, Err(StoreError::SellerNotParticipant)));

    assert_eq!(app.balance(&shop.buyer.account_id).await?, 1000);

    Ok(())
}

#[tokio::test]
async fn concurrent_first_subscriptions_make_one_row() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let shop = setup_shop(&app, 100, DAYS, 1000).await?;
    let request = plain(shop.product_id);

    let (a, b) = tokio::join!(
        subscribe(&app, &shop, &request),
        subscribe(&app, &shop, &request),
    );
    let (a, b) = (a?, b?);

    // One call created the row and the other extended it.
    assert_ne!(a.renewed, b.renewed);
    assert_eq!(a.subscription.id, b.subscription.id);

    let rows = subscription_rows(&app, &shop).await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].expires_at, app.time_source.now() + PERIOD + PERIOD);
    assert_eq!(key_count(&app, &shop).await?, 1);
    assert_eq!(app.balance(&shop.buyer.account_id).await?, 800);

    Ok(())
}

#[tokio::test]
async fn cancel_revokes_access() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let shop = setup_shop(&app, 100, DAYS, 1000).await?;
    let purchase = subscribe(&app, &shop, &plain(shop.product_id)).await?;
    let id = purchase.subscription.id;

    // Only the owner can cancel.
    let result = subscription::cancel_subscription(
        &shop.seller.user_id,
        &id,
        &app.time_source,
        &app.db_pool,
    )
    .await;
    assert!(matches!(result, Err(StoreError::SubscriptionNotFound)));

    let cancelled = subscription::cancel_subscription(
        &shop.buyer.user_id,
        &id,
        &app.time_source,
        &app.db_pool,
    )
    .await?;
    assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);
    assert_eq!(key_count(&app, &shop).await?, 0);
    assert!(
        !subscription::check_access(
            &shop.buyer.user_id,
            &shop.product_id,
            &app.db_pool
        )
        .await?
    );
    // No refund.
    assert_eq!(app.balance(&shop.buyer.account_id).await?, 900);

    let again = subscription::cancel_subscription(
        &shop.buyer.user_id,
        &id,
        &app.time_source,
        &app.db_pool,
    )
    .await;
    assert!(matches!(again, Err(StoreError::SubscriptionNotActive)));

    // Renewing a cancelled subscription starts a new one.
    let restarted = subscription::renew(
        &shop.buyer.user_id,
        &id,
        None,
        &app.time_source,
        &app.db_pool,
    )
    .await?;
    assert!(!restarted.renewed);
    assert_ne!(restarted.subscription.id, id);
    assert_eq!(get_subscription(&app, &id).await?.status, SubscriptionStatus::Cancelled);
    assert_eq!(key_count(&app, &shop).await?, 1);

    Ok(())
}

#[tokio::test]
async fn renew_requires_ownership() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let shop = setup_shop(&app, 100, DAYS, 1000).await?;
    let purchase = subscribe(&app, &shop, &plain(shop.product_id)).await?;

    let result = subscription::renew(
        &shop.seller.user_id,
        &purchase.subscription.id,
        None,
        &app.time_source,
        &app.db_pool,
    )
    .await;
    assert!(matches!(result, Err(StoreError::SubscriptionNotFound)));

    Ok(())
}

#[tokio::test]
async fn active_subscriptions_soonest_expiry_first() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let shop = setup_shop(&app, 10, DAYS, 1000).await?;
    let weekly = app
        .create_product(&shop.league_id, &shop.seller.user_id, "Weekly Tips", 5, 7)
        .await?;

    subscribe(&app, &shop, &plain(shop.product_id)).await?;
    subscribe(&app, &shop, &plain(weekly)).await?;

    let active =
        subscription::list_active_subscriptions(&shop.buyer.user_id, &app.db_pool)
            .await?;
    let names: Vec<_> = active.iter().map(|a| a.product_name.as_str()).collect();
    assert_eq!(names, vec!["Weekly Tips", "Match Analytics"]);

    let none =
        subscription::list_active_subscriptions(&shop.seller.user_id, &app.db_pool)
            .await?;
    assert!(none.is_empty());

    Ok(())
}

#[tokio::test]
async fn check_access_falls_back_to_active_row() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let shop = setup_shop(&app, 10, DAYS, 100).await?;
    subscribe(&app, &shop, &plain(shop.product_id)).await?;

    // Permission set edited out from under the engine.
    sqlx::query("UPDATE users SET permissions = '{}' WHERE id = $1")
        .bind(shop.buyer.user_id)
        .execute(&app.db_pool)
        .await?;

    assert!(
        subscription::check_access(
            &shop.buyer.user_id,
            &shop.product_id,
            &app.db_pool
        )
        .await?
    );

    let missing = subscription::check_access(
        &payloads::UserId(Uuid::new_v4()),
        &shop.product_id,
        &app.db_pool,
    )
    .await;
    assert!(matches!(missing, Err(StoreError::UserNotFound)));

    Ok(())
}
