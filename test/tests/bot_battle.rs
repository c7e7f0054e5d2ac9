use std::time::Duration;

use tokio::sync::watch;

use duel_bot::{BotController, Personality};
use duel_peer::{BattleResolvedEvent, ChatReceivedEvent, GroupEventTriggeredEvent};
use duel_shared::messages::CeremonyState;
use duel_test::{connected_mesh, expect_event, next_event};

fn quick(personality: Personality) -> Personality {
    personality.with_delay(Duration::ZERO, Duration::from_millis(10))
}

#[tokio::test]
async fn two_bots_fight_to_an_agreed_result() {
    let nodes = connected_mesh(2).await;
    let (a, b) = (&nodes[0], &nodes[1]);
    let (stop, shutdown) = watch::channel(false);
    let brawler = quick(Personality::archetype("aggressive").unwrap()).with_aggression(1.0);

    let bots = vec![
        BotController::new(a.clone(), brawler.clone())
            .unwrap()
            .with_seed(1)
            .spawn(shutdown.clone()),
        BotController::new(b.clone(), brawler.with_caution(0.0))
            .unwrap()
            .with_seed(2)
            .spawn(shutdown),
    ];
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();
    tokio::time::sleep(Duration::from_millis(20)).await;

    a.propose_battle(b.local_id()).unwrap();

    let patience = Duration::from_secs(30);
    let a_result = next_event::<BattleResolvedEvent>(&mut a_events, patience)
        .await
        .expect("bots finish the battle");
    let b_result = next_event::<BattleResolvedEvent>(&mut b_events, patience)
        .await
        .expect("both replicas resolve");
    assert!(a_result.agrees_with(&b_result));

    stop.send(true).unwrap();
    for bot in bots {
        bot.await.unwrap();
    }
}

#[tokio::test]
async fn chatty_bot_greets_back() {
    let nodes = connected_mesh(2).await;
    let (human, bot_node) = (&nodes[0], &nodes[1]);
    let (stop, shutdown) = watch::channel(false);
    let bot = BotController::new(
        bot_node.clone(),
        quick(Personality::archetype("social").unwrap()).with_chattiness(1.0),
    )
    .unwrap()
    .spawn(shutdown);
    let mut events = human.subscribe();
    tokio::time::sleep(Duration::from_millis(20)).await;

    human.send_chat("hello everyone", None).unwrap();

    let reply = expect_event!(events, ChatReceivedEvent);
    assert_eq!(&reply.from, bot_node.local_id());
    assert!(reply.direct);

    stop.send(true).unwrap();
    bot.await.unwrap();
}

#[tokio::test]
async fn sociable_bot_joins_activities() {
    let nodes = connected_mesh(2).await;
    let (host, bot_node) = (&nodes[0], &nodes[1]);
    let (stop, shutdown) = watch::channel(false);
    let bot = BotController::new(
        bot_node.clone(),
        quick(Personality::default()).with_sociability(1.0),
    )
    .unwrap()
    .spawn(shutdown);
    let mut events = host.subscribe();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let ceremony_id = host.invite_peer(bot_node.local_id(), "picnic").unwrap();

    let outcome = expect_event!(events, GroupEventTriggeredEvent);
    assert_eq!(outcome.ceremony_id, ceremony_id);
    assert_eq!(outcome.state, CeremonyState::Accepted);

    stop.send(true).unwrap();
    bot.await.unwrap();
}
