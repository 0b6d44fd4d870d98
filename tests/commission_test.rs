mod common;

use afrimobile_ledger::domain::{Currency, Decimal, Generation, Purchase, PurchaseKind, TimeMs, UserId};
use common::{dec, setup, Harness};

async fn chain(h: &Harness) -> (UserId, UserId, UserId, UserId) {
    let a = h.user("a", None).await;
    let b = h.user("b", Some("a")).await;
    let c = h.user("c", Some("b")).await;
    let d = h.user("d", Some("c")).await;
    (a, b, c, d)
}

async fn earnings(h: &Harness, user: &UserId) -> Decimal {
    h.ledger.balance(user).await.unwrap().total_earnings
}

#[tokio::test]
async fn test_three_generation_credits() {
    let h = setup().await;
    let (a, b, c, d) = chain(&h).await;

    h.purchase("p1", &d, "10000").await;

    assert_eq!(earnings(&h, &c).await, dec("1500"));
    assert_eq!(earnings(&h, &b).await, dec("300"));
    assert_eq!(earnings(&h, &a).await, dec("200"));
    assert_eq!(earnings(&h, &d).await, Decimal::zero());

    let sheet = h.ledger.balance(&c).await.unwrap();
    let g1 = sheet.generation(Generation::new(1).unwrap());
    assert_eq!(g1.count, 1);
    assert_eq!(g1.earnings, dec("1500"));

    let credits = h.repo.credits_for_purchase("p1").await.unwrap();
    assert_eq!(credits.len(), 3);
    assert_eq!(credits[0].rate_at_post, dec("15"));
    for user in [&a, &b, &c] {
        h.assert_consistent(user).await;
    }
}

#[tokio::test]
async fn test_replay_is_noop() {
    let h = setup().await;
    let (a, b, c, d) = chain(&h).await;
    h.purchase("p1", &d, "10000").await;

    for _ in 0..10 {
        let outcome = h.ledger.apply_purchase("p1").await.unwrap();
        assert!(outcome.inserted.is_empty());
        assert_eq!(outcome.already_posted, 3);
    }

    assert_eq!(earnings(&h, &c).await, dec("1500"));
    assert_eq!(earnings(&h, &b).await, dec("300"));
    assert_eq!(earnings(&h, &a).await, dec("200"));
    assert_eq!(h.repo.credits_for_purchase("p1").await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_chain_lengths() {
    let h = setup().await;
    // e <- f <- g <- i <- j: j's purchase reaches i, g, f but not e.
    let e = h.user("e", None).await;
    let f = h.user("f", Some("e")).await;
    let g = h.user("g", Some("f")).await;
    let i = h.user("i", Some("g")).await;
    let j = h.user("j", Some("i")).await;

    h.purchase("p-e", &e, "1000").await;
    assert!(h.repo.credits_for_purchase("p-e").await.unwrap().is_empty());

    h.purchase("p-f", &f, "1000").await;
    assert_eq!(h.repo.credits_for_purchase("p-f").await.unwrap().len(), 1);

    h.purchase("p-g", &g, "1000").await;
    assert_eq!(h.repo.credits_for_purchase("p-g").await.unwrap().len(), 2);

    h.purchase("p-j", &j, "1000").await;
    let credits = h.repo.credits_for_purchase("p-j").await.unwrap();
    let beneficiaries: Vec<&str> = credits.iter().map(|c| c.beneficiary_id.as_str()).collect();
    assert_eq!(beneficiaries, vec!["i", "g", "f"]);
    assert!(credits.iter().all(|c| c.beneficiary_id != e));
    let _ = i;
}

#[tokio::test]
async fn test_self_cycle_suppressed() {
    let h = setup().await;
    let s = h.user("s", Some("s")).await;

    h.purchase("p1", &s, "10000").await;

    assert!(h.repo.credits_for_purchase("p1").await.unwrap().is_empty());
    assert_eq!(earnings(&h, &s).await, Decimal::zero());
}

#[tokio::test]
async fn test_sibling_cycle_never_credits_buyer() {
    let h = setup().await;
    // x -> y -> x
    let x = h.user("x", Some("y")).await;
    let y = h.user("y", Some("x")).await;

    h.purchase("p1", &x, "10000").await;

    let credits = h.repo.credits_for_purchase("p1").await.unwrap();
    // gen 1 is y, gen 2 would be the buyer, gen 3 is y again.
    assert!(credits.iter().all(|c| c.beneficiary_id == y));
    assert!(credits.iter().all(|c| c.beneficiary_id != x));
    assert_eq!(earnings(&h, &x).await, Decimal::zero());
    h.assert_consistent(&y).await;
}

#[tokio::test]
async fn test_zero_amount_and_foreign_currency() {
    let h = setup().await;
    let parent = h.user("parent", None).await;
    let child = h.user("child", Some("parent")).await;

    h.purchase("zero", &child, "0").await;
    assert!(h.repo.credits_for_purchase("zero").await.unwrap().is_empty());

    h.purchase("one", &child, "1").await;
    assert_eq!(earnings(&h, &parent).await, dec("0.15"));

    let usd = Purchase {
        id: "usd".to_string(),
        buyer_id: child.clone(),
        kind: PurchaseKind::Cofounder,
        gross_amount: dec("100"),
        currency: Currency::new("USD"),
        shares: 1,
        completed_at: Some(TimeMs::now()),
    };
    h.repo.insert_purchase(&usd).await.unwrap();
    h.ledger.apply_purchase("usd").await.unwrap();
    let credits = h.repo.credits_for_purchase("usd").await.unwrap();
    assert_eq!(credits[0].currency.as_str(), "USD");
    assert_eq!(credits[0].amount, dec("15"));
}

#[tokio::test]
async fn test_concurrent_purchases_same_buyer() {
    let h = setup().await;
    let (a, b, c, d) = chain(&h).await;

    for id in ["c1", "c2"] {
        let purchase = Purchase {
            id: id.to_string(),
            buyer_id: d.clone(),
            kind: PurchaseKind::Regular,
            gross_amount: dec("10000"),
            currency: Currency::ngn(),
            shares: 1,
            completed_at: Some(TimeMs::now()),
        };
        h.repo.insert_purchase(&purchase).await.unwrap();
    }

    let (r1, r2) = tokio::join!(h.ledger.apply_purchase("c1"), h.ledger.apply_purchase("c2"));
    r1.unwrap();
    r2.unwrap();

    assert_eq!(earnings(&h, &c).await, dec("3000"));
    assert_eq!(earnings(&h, &b).await, dec("600"));
    assert_eq!(earnings(&h, &a).await, dec("400"));
    for user in [&a, &b, &c] {
        h.assert_consistent(user).await;
    }
}
