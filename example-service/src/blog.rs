// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! A service that creates, reads, updates, deletes and lists blogs kept in a [`BlogStore`].

use serde::{Deserialize, Serialize};
use std::{
    fmt,
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use streamrpc::{
    client::{self, ResponseStream},
    context,
    server::{ResponseSink, Service},
    Codec, Json, RpcError, Status,
};

/// Identifies a stored blog. Rendered as 24 lowercase hex digits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlogId([u8; 12]);

impl BlogId {
    /// Returns a new random ID.
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for BlogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// The error returned when a string is not a [`BlogId`].
#[derive(Debug, thiserror::Error)]
#[error("{0:?} is not 24 hex digits")]
pub struct ParseBlogIdError(String);

impl FromStr for BlogId {
    type Err = ParseBlogIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 24 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ParseBlogIdError(s.to_owned()));
        }
        let mut bytes = [0; 12];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[2 * i..2 * i + 2], 16)
                .map_err(|_| ParseBlogIdError(s.to_owned()))?;
        }
        Ok(Self(bytes))
    }
}

/// A blog as it is sent over the wire.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blog {
    pub id: String,
    pub author_id: String,
    pub title: String,
    pub content: String,
}

/// The request of `CreateBlog`: a blog that has no ID yet.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBlog {
    pub author_id: String,
    pub title: String,
    pub content: String,
}

/// A blog as it is kept in a [`BlogStore`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlogItem {
    pub id: BlogId,
    pub author_id: String,
    pub title: String,
    pub content: String,
}

impl From<BlogItem> for Blog {
    fn from(item: BlogItem) -> Self {
        Self {
            id: item.id.to_string(),
            author_id: item.author_id,
            title: item.title,
            content: item.content,
        }
    }
}

/// A failure of the backing store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("the store is unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for Status {
    fn from(e: StoreError) -> Self {
        Status::internal(format!("internal error: {e}"))
    }
}

/// Where blogs are kept.
pub trait BlogStore: Send + Sync + 'static {
    /// Stores a new blog.
    fn insert(&self, item: BlogItem) -> Result<(), StoreError>;

    /// Returns the blog stored under `id`, if any.
    fn find(&self, id: BlogId) -> Result<Option<BlogItem>, StoreError>;

    /// Replaces the blog stored under `item.id`. Returns false iff no such blog is stored.
    fn replace(&self, item: BlogItem) -> Result<bool, StoreError>;

    /// Deletes the blog stored under `id`. Returns false iff no such blog is stored.
    fn delete(&self, id: BlogId) -> Result<bool, StoreError>;

    /// Returns every stored blog, oldest first.
    fn list(&self) -> Result<Vec<BlogItem>, StoreError>;
}

/// A [`BlogStore`] that keeps blogs in memory.
#[derive(Debug, Default)]
pub struct InMemoryBlogStore {
    items: Mutex<Vec<BlogItem>>,
}

impl InMemoryBlogStore {
    fn items(&self) -> MutexGuard<'_, Vec<BlogItem>> {
        // Every critical section leaves the vec valid.
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BlogStore for InMemoryBlogStore {
    fn insert(&self, item: BlogItem) -> Result<(), StoreError> {
        self.items().push(item);
        Ok(())
    }

    fn find(&self, id: BlogId) -> Result<Option<BlogItem>, StoreError> {
        Ok(self.items().iter().find(|item| item.id == id).cloned())
    }

    fn replace(&self, item: BlogItem) -> Result<bool, StoreError> {
        let mut items = self.items();
        match items.iter_mut().find(|stored| stored.id == item.id) {
            Some(stored) => {
                *stored = item;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn delete(&self, id: BlogId) -> Result<bool, StoreError> {
        let mut items = self.items();
        let len = items.len();
        items.retain(|item| item.id != id);
        Ok(items.len() < len)
    }

    fn list(&self) -> Result<Vec<BlogItem>, StoreError> {
        Ok(self.items().clone())
    }
}

fn parse_id(id: &str) -> Result<BlogId, Status> {
    id.parse()
        .map_err(|e| Status::invalid_argument(format!("cannot parse id: {e}")))
}

fn not_found(id: BlogId) -> Status {
    Status::not_found(format!("cannot find a blog with id {id}"))
}

async fn create_blog(store: &impl BlogStore, blog: NewBlog) -> Result<Blog, Status> {
    let item = BlogItem {
        id: BlogId::random(),
        author_id: blog.author_id,
        title: blog.title,
        content: blog.content,
    };
    store.insert(item.clone())?;
    tracing::info!(id = %item.id, "CreateBlog");
    Ok(item.into())
}

async fn read_blog(store: &impl BlogStore, id: &str) -> Result<Blog, Status> {
    let id = parse_id(id)?;
    let item = store.find(id)?.ok_or_else(|| not_found(id))?;
    Ok(item.into())
}

async fn update_blog(store: &impl BlogStore, blog: Blog) -> Result<Blog, Status> {
    let item = BlogItem {
        id: parse_id(&blog.id)?,
        author_id: blog.author_id,
        title: blog.title,
        content: blog.content,
    };
    if !store.replace(item.clone())? {
        return Err(not_found(item.id));
    }
    Ok(item.into())
}

async fn delete_blog(store: &impl BlogStore, id: String) -> Result<String, Status> {
    let parsed = parse_id(&id)?;
    if !store.delete(parsed)? {
        return Err(not_found(parsed));
    }
    Ok(id)
}

async fn list_blog(store: &impl BlogStore, sink: &mut ResponseSink<Blog>) -> Result<(), Status> {
    for item in store.list()? {
        sink.send(&item.into()).await?;
    }
    Ok(())
}

/// Registers the blog methods on `service`. Blogs are kept in `store`.
pub fn register<C: Codec, S: BlogStore>(service: Service<C>, store: Arc<S>) -> Service<C> {
    let service = service.unary("CreateBlog", {
        let store = Arc::clone(&store);
        move |_, blog: NewBlog| {
            let store = Arc::clone(&store);
            async move { create_blog(&*store, blog).await }
        }
    });
    let service = service.unary("ReadBlog", {
        let store = Arc::clone(&store);
        move |_, id: String| {
            let store = Arc::clone(&store);
            async move { read_blog(&*store, &id).await }
        }
    });
    let service = service.unary("UpdateBlog", {
        let store = Arc::clone(&store);
        move |_, blog: Blog| {
            let store = Arc::clone(&store);
            async move { update_blog(&*store, blog).await }
        }
    });
    let service = service.unary("DeleteBlog", {
        let store = Arc::clone(&store);
        move |_, id: String| {
            let store = Arc::clone(&store);
            async move { delete_blog(&*store, id).await }
        }
    });
    service.server_streaming(
        "ListBlog",
        move |_, (): (), mut sink: ResponseSink<Blog>| {
            let store = Arc::clone(&store);
            async move { list_blog(&*store, &mut sink).await }
        },
    )
}

/// A typed client of the blog methods.
#[derive(Clone, Debug)]
pub struct BlogClient {
    channel: client::Channel<Json>,
}

impl BlogClient {
    pub fn new(channel: client::Channel<Json>) -> Self {
        Self { channel }
    }

    /// Stores `blog` and returns it with its new ID.
    pub async fn create_blog(
        &self,
        ctx: context::Context,
        blog: &NewBlog,
    ) -> Result<Blog, RpcError> {
        self.channel.unary(ctx, "CreateBlog", blog).await
    }

    /// Returns the blog with `id`. Fails with [`NotFound`](streamrpc::Code::NotFound) if there is
    /// none, and [`InvalidArgument`](streamrpc::Code::InvalidArgument) if `id` is malformed.
    pub async fn read_blog(&self, ctx: context::Context, id: &str) -> Result<Blog, RpcError> {
        self.channel.unary(ctx, "ReadBlog", id).await
    }

    /// Replaces the stored blog with the same ID as `blog`.
    pub async fn update_blog(&self, ctx: context::Context, blog: &Blog) -> Result<Blog, RpcError> {
        self.channel.unary(ctx, "UpdateBlog", blog).await
    }

    /// Deletes the blog with `id`, returning the ID.
    pub async fn delete_blog(&self, ctx: context::Context, id: &str) -> Result<String, RpcError> {
        self.channel.unary(ctx, "DeleteBlog", id).await
    }

    /// Streams every stored blog.
    pub async fn list_blog(
        &self,
        ctx: context::Context,
    ) -> Result<ResponseStream<Blog>, RpcError> {
        self.channel.server_streaming(ctx, "ListBlog", &()).await
    }
}
