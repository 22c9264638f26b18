use std::env;
use std::sync::Arc;

use evlog::{LogEventConsolePrinter, Logger};
use uuid::Uuid;

use livepoll::db::dbclient::DBClient;
use livepoll::db::model::PgStore;
use livepoll::runtime::set_logger;
use livepoll::sync::{LiveTally, TallySnapshot};
use livepoll::{tally, Poll, PollStore};

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let mut logger = Logger::default();
    logger.register(LogEventConsolePrinter::default());
    set_logger(logger);

    let db_url = env::var("LIVEPOLL_DATABASE_URL").expect("expected LIVEPOLL_DATABASE_URL");
    let poll_id: Uuid = env::args()
        .nth(1)
        .expect("usage: livepoll <poll-id>")
        .parse()
        .expect("poll id is not a valid UUID");

    let db_client = DBClient::new(&db_url).await
        .expect("failed to connect to database");
    let store = Arc::new(PgStore::new(db_client));

    let poll = store.get_poll(poll_id).await
        .expect("failed to load poll")
        .expect("no poll with that id");

    let live = LiveTally::open(store, poll.clone());
    let mut rx = live.watch();

    loop {
        render(&poll, &rx.borrow_and_update().clone());

        if rx.changed().await.is_err() {
            break;
        }
    }
}

fn render(poll: &Poll, snapshot: &TallySnapshot) {
    println!();
    println!("{}  [{:?}]  {} votes", poll.question, snapshot.connection, snapshot.total_votes());

    for entry in tally::display_order(&snapshot.results) {
        println!("  {:>5.1}%  {:>4}  {}", entry.percentage, entry.count, entry.option_text);
    }
}
