use posthog_batch::{CaptureEvent, ClientConfig, IdentifyEvent};

#[tokio::main]
async fn main() -> posthog_batch::Result<()> {
    // Configure env_logger to see client logs.
    env_logger::Builder::from_env(env_logger::Env::new().default_filter_or("posthog")).init();

    // Reads POSTHOG_API_KEY, POSTHOG_ENDPOINT, POSTHOG_DRYRUN, etc.
    let client = ClientConfig::from_env()?.debug_enabled(true).to_client();
    if !client.is_enabled() {
        println!("POSTHOG_API_KEY is not set, events will be ignored");
    }

    client.add_event(IdentifyEvent::new("demo-user").property("email", "demo@example.com"));
    for page in ["home", "pricing", "signup"] {
        client.add_event(
            CaptureEvent::new("$pageview", "demo-user")
                .property("page", page)
                .with_current_timestamp(),
        );
    }

    // Every call of the wrapped function is captured once it returns.
    let checkout = client
        .capture()
        .event("checkout")
        .distinct_id("demo-user")
        .wrap(|items: u32, event: &mut CaptureEvent| {
            event.properties.insert("items".to_owned(), items.into());
            items * 10
        });
    println!("Checkout total: {}", checkout.call(3));

    // Events sent while the scope is alive go out when it ends.
    {
        let scope = client.scope();
        scope.add_event(CaptureEvent::new("demo finished", "demo-user"));
    }

    let stats = client.stop().await?;
    println!("{stats}");

    Ok(())
}
