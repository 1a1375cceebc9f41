use splyt::{EntityInfo, InitParams, Purchase, SessionController};

pub fn main() -> splyt::Result<()> {
    env_logger::init();

    let customer_id = std::env::var("SPLYT_CUSTOMER_ID").unwrap_or_else(|_| "acme-test".to_owned());
    let storage_dir = std::env::temp_dir().join("splyt-demo");

    let session = SessionController::new();

    // Block until the device and user are registered. On failure the session still becomes ready
    // and uses cached tuning.
    if let Err(err) = session.init_blocking(
        InitParams::new(customer_id)
            .user(EntityInfo::user_with("demo-user", |user| {
                user.set_property("plan", "free");
            }))
            .storage_dir(storage_dir)
            .log_enabled(true),
    ) {
        println!("Init failed, continuing offline: {err}");
    }

    let lives: i64 = session.tuning().get_var("startingLives", 3);
    println!("Starting lives: {lives}");

    let instrumentation = session.instrumentation();

    let mut tutorial = instrumentation.transaction_with_id("Tutorial", "step1");
    tutorial.begin()?;
    tutorial.update_at_progress(50);
    tutorial.end();

    instrumentation
        .purchase_transaction(Some("order-1"))
        .set_purchase(&Purchase::new().price(0.99, "usd").item_name("Gems x100"))
        .begin_and_end()?;
    instrumentation.update_collection("gems", 100.0, 100.0, true)?;

    println!("Flush: {:?}", session.flush());

    // Persist anything left undelivered for the next run.
    session.pause()?;
    session.shutdown()
}
