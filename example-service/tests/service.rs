use assert_matches::assert_matches;
use futures::prelude::*;
use service::{
    blog::{Blog, BlogClient, InMemoryBlogStore, NewBlog},
    calculator::CalculatorClient,
    greet::{GreetClient, Greeting, GREET_MANY_TIMES},
};
use std::time::Duration;
use streamrpc::{client, context, server::BaseChannel, transport, Code, Json};

fn connect() -> client::Channel<Json> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let (client_transport, server_transport) = transport::channel::unbounded();
    let service = service::service(InMemoryBlogStore::default());
    tokio::spawn(BaseChannel::with_defaults(server_transport).execute(service));
    client::new(client::Config::default(), client_transport, Json).spawn()
}

#[tokio::test]
async fn greet_in_every_shape() -> anyhow::Result<()> {
    let greet = GreetClient::new(connect());
    let david = Greeting::new("David", "Nastasi");

    assert_eq!(greet.greet(context::current(), &david).await?, "Hello David");
    // A greeting without a first name is still answered.
    assert_eq!(
        greet.greet(context::current(), &Greeting::default()).await?,
        "Hello "
    );

    let greetings: Vec<String> = greet
        .greet_many_times(context::current(), david.clone(), Duration::ZERO)
        .await?
        .try_collect()
        .await?;
    assert_eq!(greetings.len(), GREET_MANY_TIMES);
    assert_eq!(greetings[3], "Hello David number 3");

    let mut long_greet = greet.long_greet(context::current()).await?;
    for name in ["David", "Franco"] {
        long_greet.send(&Greeting::new(name, "Nastasi")).await?;
    }
    assert_eq!(
        long_greet.close_and_receive().await?,
        "Hello David! Hello Franco! "
    );

    let (mut sink, mut responses) = greet.greet_everyone(context::current()).await?.split();
    for name in ["David", "Franco", "Victoria"] {
        sink.send(&Greeting::new(name, "Nastasi")).await?;
        assert_eq!(responses.message().await?, Some(format!("Hello {name}!")));
    }
    sink.close().await?;
    assert_eq!(responses.message().await?, None);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn greet_with_deadline() -> anyhow::Result<()> {
    let greet = GreetClient::new(connect());
    let david = Greeting::new("David", "Nastasi");

    let ctx = context::current().with_timeout(Duration::from_secs(5));
    assert_eq!(greet.greet_with_deadline(ctx, &david).await?, "Hello David");

    let ctx = context::current().with_timeout(Duration::from_secs(1));
    assert_matches!(
        greet.greet_with_deadline(ctx, &david).await,
        Err(e) if e.code() == Some(Code::DeadlineExceeded)
    );
    Ok(())
}

#[tokio::test]
async fn square_root() -> anyhow::Result<()> {
    let calculator = CalculatorClient::new(connect());
    assert_eq!(calculator.square_root(context::current(), 81).await?, 9.0);
    assert_matches!(
        calculator.square_root(context::current(), -1).await,
        Err(e) if e.code() == Some(Code::InvalidArgument)
    );
    Ok(())
}

#[tokio::test]
async fn blog_lifecycle() -> anyhow::Result<()> {
    let blog = BlogClient::new(connect());

    let created = blog
        .create_blog(
            context::current(),
            &NewBlog {
                author_id: "David".into(),
                title: "My first blog".into(),
                content: "Content of the first blog".into(),
            },
        )
        .await?;
    assert_eq!(created.id.len(), 24);
    assert_eq!(blog.read_blog(context::current(), &created.id).await?, created);

    assert_matches!(
        blog.read_blog(context::current(), "not an id").await,
        Err(e) if e.code() == Some(Code::InvalidArgument)
    );
    assert_matches!(
        blog.read_blog(context::current(), "000000000000000000000000").await,
        Err(e) if e.code() == Some(Code::NotFound)
    );

    let edited = Blog {
        title: "My first blog (edited)".into(),
        ..created.clone()
    };
    assert_eq!(blog.update_blog(context::current(), &edited).await?, edited);
    assert_eq!(blog.read_blog(context::current(), &created.id).await?, edited);

    let listed: Vec<Blog> = blog.list_blog(context::current()).await?.try_collect().await?;
    assert_eq!(listed, [edited.clone()]);

    assert_eq!(
        blog.delete_blog(context::current(), &created.id).await?,
        created.id
    );
    assert_matches!(
        blog.delete_blog(context::current(), &created.id).await,
        Err(e) if e.code() == Some(Code::NotFound)
    );
    assert_matches!(
        blog.update_blog(context::current(), &edited).await,
        Err(e) if e.code() == Some(Code::NotFound)
    );
    let listed: Vec<Blog> = blog.list_blog(context::current()).await?.try_collect().await?;
    assert!(listed.is_empty());
    Ok(())
}
