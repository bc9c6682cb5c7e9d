mod subscriptions;

use payloads::{LeagueId, ProductId, Subscription, SubscriptionId};
use test_helpers::{Member, TestApp, spawn_app};

/// A league with one seller offering a subscription product and one funded
/// buyer.
pub struct Shop {
    pub league_id: LeagueId,
    pub seller: Member,
    pub buyer: Member,
    pub product_id: ProductId,
}

pub async fn setup_shop(
    app: &TestApp,
    price: i64,
    subscription_days: i32,
    buyer_funds: i64,
) -> anyhow::Result<Shop> {
    let league_id = app.create_league("Sunday League").await?;
    let seller = app.create_member(&league_id, "seller").await?;
    let buyer = app.create_member(&league_id, "buyer").await?;
    let product_id = app
        .create_product(
            &league_id,
            &seller.user_id,
            "Match Analytics",
            price,
            subscription_days,
        )
        .await?;
    if buyer_funds > 0 {
        app.fund(&league_id, &buyer.account_id, buyer_funds).await?;
    }
    Ok(Shop {
        league_id,
        seller,
        buyer,
        product_id,
    })
}

pub async fn get_subscription(
    app: &TestApp,
    subscription_id: &SubscriptionId,
) -> anyhow::Result<Subscription> {
    let subscription = sqlx::query_as::<_, Subscription>(
        "SELECT * FROM subscriptions WHERE id = $1",
    )
    .bind(subscription_id)
    .fetch_one(&app.db_pool)
    .await?;
    Ok(subscription)
}

pub async fn subscription_rows(
    app: &TestApp,
    shop: &Shop,
) -> anyhow::Result<Vec<Subscription>> {
    let rows = sqlx::query_as::<_, Subscription>(
        "SELECT * FROM subscriptions WHERE user_id = $1 AND product_id = $2",
    )
    .bind(shop.buyer.user_id)
    .bind(shop.product_id)
    .fetch_all(&app.db_pool)
    .await?;
    Ok(rows)
}

#[tokio::test]
async fn migrations_create_an_empty_ledger() -> anyhow::Result<()> {
    let app = spawn_app().await;

    let accounts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM accounts")
        .fetch_one(&app.db_pool)
        .await?;
    assert_eq!(accounts, 0);

    Ok(())
}
