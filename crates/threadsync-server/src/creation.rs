//! Post allocation: threads, replies, splices and closing.
//!
//! Every handler validates first and writes last. The only mutation of an
//! existing thread is a single [`Storage::update_thread`] call whose plan
//! re-checks the conditions it depends on, so concurrent writers to the same
//! thread (other connections, the upkeep scheduler) can never interleave
//! inside a decision.
//!
//! A connection owns at most one open post. Creating a new post first closes
//! the previous one through the same path as an explicit close, without
//! reporting anything to the client.

use threadsync_core::{Environment, Image, Post, SpliceError, Thread};
use threadsync_proto::{
    ImageRequest, MessageType, PostCommon, ReplyCreationRequest, SpliceMessage, SpliceRequest,
    ThreadCreationRequest, ThreadCreationResponse, encode_message,
};

use crate::{
    client::{Client, OpenPost},
    context::ServerContext,
    error::{Rejection, RequestError},
    storage::{Outcome, PostPatch, Storage, StorageError, ThreadUpdate},
};

/// Longest accepted image token, in bytes.
pub const MAX_TOKEN_LEN: usize = 127;

/// Longest accepted image file name, in bytes.
pub const MAX_IMAGE_NAME_LEN: usize = 200;

/// Email value that keeps a reply from bumping its thread.
pub const SAGE: &str = "sage";

const SALT_LEN: usize = 16;

/// Create a thread and its opening post, which becomes the client's open
/// post.
///
/// A failed captcha is an answer, not an error: the client receives the
/// rejected response code and stays usable.
pub fn insert_thread<S: Storage, E: Environment>(
    ctx: &ServerContext<S, E>,
    client: &mut Client,
    req: &ThreadCreationRequest,
) -> Result<ThreadCreationResponse, RequestError> {
    close_previous_post(ctx, client)?;

    if ctx.boards.is_meta(&req.board) {
        return Err(Rejection::InvalidBoard(req.board.clone()).into());
    }
    let config =
        ctx.boards.config(&req.board).ok_or_else(|| Rejection::InvalidBoard(req.board.clone()))?;
    if config.read_only {
        return Err(Rejection::ReadOnlyBoard(req.board.clone()).into());
    }

    if !ctx.captcha.verify(&req.captcha, client.ip) {
        tracing::debug!(connection = client.id, board = %req.board, "captcha rejected");
        return Ok(ThreadCreationResponse::captcha_rejected());
    }

    let mut op = construct_post(ctx, client, &req.common, String::new())?;
    let subject = ctx.parser.parse_subject(&req.subject)?;
    if !config.text_only {
        op.image = Some(resolve_image(ctx, &req.common.image)?);
    }

    let image = op.image.clone();
    let (id, time) = match commit_thread(ctx, &req.board, subject, op) {
        Ok(committed) => committed,
        Err(e) => {
            release_image(ctx, image.as_ref());
            return Err(e.into());
        },
    };

    client.open_post = Some(OpenPost { id, op: id, board: req.board.clone(), time });
    ctx.storage.increment_board_counter(&req.board)?;

    tracing::info!(connection = client.id, board = %req.board, thread = id, "thread created");
    Ok(ThreadCreationResponse::created(id))
}

/// Create a reply in the thread the client is synchronised to, returning
/// its identifier. The reply becomes the client's open post.
///
/// A body containing a line break is committed up to the break; the rest
/// follows as a splice at the end of the committed body.
pub fn insert_post<S: Storage, E: Environment>(
    ctx: &ServerContext<S, E>,
    client: &mut Client,
    req: &ReplyCreationRequest,
) -> Result<u64, RequestError> {
    close_previous_post(ctx, client)?;

    let sync = client.sync.clone().filter(|sync| sync.is_thread()).ok_or(Rejection::NotSynced)?;
    let config =
        ctx.boards.config(&sync.board).ok_or_else(|| Rejection::InvalidBoard(sync.board.clone()))?;
    if config.read_only {
        return Err(Rejection::ReadOnlyBoard(sync.board.clone()).into());
    }

    let has_image = !config.text_only && req.common.image.is_present();
    if req.body.is_empty() && !has_image {
        return Err(Rejection::NoTextOrImage.into());
    }
    let max_body_len = ctx.posting.max_body_len;
    if req.body.chars().count() > max_body_len {
        return Err(Rejection::BodyTooLong { max: max_body_len }.into());
    }

    let meta = ctx.storage.thread_meta(sync.op)?.ok_or(Rejection::InvalidThread(sync.op))?;
    if meta.locked {
        return Err(Rejection::ThreadLocked(sync.op).into());
    }

    let (first, rest) = split_first_line(&req.body);
    let mut post = construct_post(ctx, client, &req.common, first.to_owned())?;
    if has_image {
        post.image = Some(resolve_image(ctx, &req.common.image)?);
    }

    let time = post.time;
    let first_len = post.body_len();
    let image = post.image.clone();
    let id = match commit_reply(ctx, sync.op, post, has_image) {
        Ok(id) => id,
        Err(e) => {
            release_image(ctx, image.as_ref());
            return Err(e);
        },
    };

    client.open_post = Some(OpenPost { id, op: sync.op, board: sync.board.clone(), time });
    ctx.storage.increment_board_counter(&sync.board)?;
    tracing::debug!(connection = client.id, thread = sync.op, post = id, "reply created");

    if !rest.is_empty() {
        let follow_up = SpliceRequest { start: first_len, len: 0, text: rest.to_owned() };
        splice(ctx, client, &follow_up)?;
    }
    Ok(id)
}

/// Reserve an identifier for the opening post and store its thread.
/// Returns the identifier and creation time.
fn commit_thread<S: Storage, E: Environment>(
    ctx: &ServerContext<S, E>,
    board: &str,
    subject: String,
    mut op: Post,
) -> Result<(u64, u64), StorageError> {
    let id = ctx.storage.reserve_post_id()?;
    op.id = id;
    op.op = id;
    let time = op.time;

    ctx.storage.insert_thread(&Thread::new(board.to_owned(), subject, op))?;
    Ok((id, time))
}

/// Reserve an identifier for a reply and append it to thread `op` in one
/// update. Nothing is written if this fails.
fn commit_reply<S: Storage, E: Environment>(
    ctx: &ServerContext<S, E>,
    op: u64,
    mut post: Post,
    has_image: bool,
) -> Result<u64, RequestError> {
    let id = ctx.storage.reserve_post_id()?;
    post.id = id;
    post.op = op;
    let time = post.time;
    let entry = encode_message(MessageType::InsertPost, &post.to_message())?;

    let bumps = post.email != SAGE;
    let max_bump = ctx.posting.max_bump;
    let outcome = ctx.storage.update_thread(op, move |thread| {
        if thread.locked {
            return Err(Rejection::ThreadLocked(thread.id));
        }

        let mut update = ThreadUpdate::new()
            .increment_post_ctr()
            .reply_time(time)
            .insert_post(post)
            .append(entry);
        if bumps && thread.post_ctr < max_bump {
            update = update.bump(time);
        }
        if has_image {
            update = update.increment_image_ctr();
        }
        Ok(update)
    })?;

    match outcome {
        Outcome::Applied(_) => Ok(id),
        Outcome::Declined(rejection) => Err(rejection.into()),
    }
}

/// Give back the image of a post that was never stored. Its token is
/// already consumed, so nothing else would release it.
fn release_image<S: Storage, E: Environment>(ctx: &ServerContext<S, E>, image: Option<&Image>) {
    let Some(image) = image else {
        return;
    };
    if let Err(e) = ctx.images.deallocate(&image.common.sha1) {
        tracing::warn!(sha1 = %image.common.sha1, error = %e, "failed to release unused image");
    }
}

/// Close the client's open post.
///
/// A post already closed by someone else (the upkeep scheduler) appends
/// nothing and still succeeds. The open post is cleared unless the store
/// fails.
pub fn close_post<S: Storage, E: Environment>(
    ctx: &ServerContext<S, E>,
    client: &mut Client,
) -> Result<(), RequestError> {
    let open = client.open_post.clone().ok_or(Rejection::NoOpenPost)?;
    let entry = encode_message(MessageType::ClosePost, &open.id)?;

    let outcome = ctx.storage.update_thread(open.op, |thread| {
        match thread.posts.get(&open.id) {
            Some(post) if post.editing => {
                Ok(ThreadUpdate::new().patch_post(open.id, PostPatch::Close).append(entry))
            },
            _ => Err(()),
        }
    });

    match outcome {
        Ok(Outcome::Applied(_)) => {
            tracing::debug!(connection = client.id, post = open.id, "post closed");
        },
        Ok(Outcome::Declined(())) => {
            tracing::debug!(connection = client.id, post = open.id, "post already closed");
        },
        Err(e) if e.is_not_found() => {
            tracing::debug!(connection = client.id, thread = open.op, "thread of open post is gone");
        },
        Err(e) => return Err(e.into()),
    }

    client.open_post = None;
    Ok(())
}

/// Close the open post, if any, before opening another.
pub fn close_previous_post<S: Storage, E: Environment>(
    ctx: &ServerContext<S, E>,
    client: &mut Client,
) -> Result<(), RequestError> {
    if client.open_post.is_none() {
        return Ok(());
    }
    close_post(ctx, client)
}

enum SpliceDecline {
    Closed,
    Invalid(SpliceError),
}

/// Edit the body of the client's open post.
pub fn splice<S: Storage, E: Environment>(
    ctx: &ServerContext<S, E>,
    client: &mut Client,
    req: &SpliceRequest,
) -> Result<(), RequestError> {
    let open = client.open_post.clone().ok_or(Rejection::NoOpenPost)?;
    let message =
        SpliceMessage { id: open.id, start: req.start, len: req.len, text: req.text.clone() };
    let entry = encode_message(MessageType::Splice, &message)?;
    let max_body_len = ctx.posting.max_body_len;

    let outcome = ctx.storage.update_thread(open.op, |thread| {
        let mut post = thread
            .posts
            .get(&open.id)
            .filter(|post| post.editing)
            .cloned()
            .ok_or(SpliceDecline::Closed)?;
        post.splice(req.start, req.len, &req.text, max_body_len).map_err(SpliceDecline::Invalid)?;

        Ok(ThreadUpdate::new().patch_post(open.id, PostPatch::SetBody(post.body)).append(entry))
    })?;

    match outcome {
        Outcome::Applied(_) => Ok(()),
        Outcome::Declined(SpliceDecline::Closed) => {
            client.open_post = None;
            Err(Rejection::NoOpenPost.into())
        },
        Outcome::Declined(SpliceDecline::Invalid(SpliceError::TooLong { max, .. })) => {
            Err(Rejection::BodyTooLong { max }.into())
        },
        Outcome::Declined(SpliceDecline::Invalid(e)) => Err(Rejection::InvalidSplice(e).into()),
    }
}

/// Fields shared by opening posts and replies. `id` and `op` are left 0
/// for the caller to fill in once an identifier is reserved.
fn construct_post<S: Storage, E: Environment>(
    ctx: &ServerContext<S, E>,
    client: &Client,
    common: &PostCommon,
    body: String,
) -> Result<Post, RequestError> {
    let (name, trip) = ctx.parser.parse_name(&common.name)?;
    let email = ctx.parser.format_email(&common.email);
    ctx.parser.verify_password(&common.password)?;

    let mut salt = [0u8; SALT_LEN];
    ctx.env.random_bytes(&mut salt);
    let password = ctx.hasher.hash(&common.password, &salt)?;

    Ok(Post {
        id: 0,
        op: 0,
        editing: true,
        time: ctx.env.wall_clock_secs(),
        body,
        name,
        trip,
        email,
        image: None,
        ip: client.ip,
        password,
    })
}

/// Consume an image token and attach its image.
///
/// Runs before an identifier is reserved so a bad token never leaves a
/// reserved id or a counter behind.
fn resolve_image<S: Storage, E: Environment>(
    ctx: &ServerContext<S, E>,
    req: &ImageRequest,
) -> Result<Image, RequestError> {
    if req.token.is_empty() || req.token.len() > MAX_TOKEN_LEN {
        return Err(Rejection::InvalidImageToken.into());
    }
    if req.name.is_empty() {
        return Err(Rejection::NoImageName.into());
    }
    if req.name.len() > MAX_IMAGE_NAME_LEN {
        return Err(Rejection::ImageNameTooLong.into());
    }

    let token = ctx.storage.take_image_token(&req.token)?.ok_or(Rejection::InvalidImageToken)?;
    if token.is_expired(ctx.env.wall_clock_secs()) {
        if let Err(e) = ctx.images.deallocate(&token.sha1) {
            tracing::warn!(sha1 = %token.sha1, error = %e, "failed to release expired image");
        }
        return Err(Rejection::InvalidImageToken.into());
    }

    let common = ctx.images.image(&token.sha1).ok_or(Rejection::InvalidImageToken)?;
    Ok(Image::new(common, req.spoiler, &req.name))
}

/// Split at the first line break. The remainder keeps the break.
fn split_first_line(body: &str) -> (&str, &str) {
    body.find('\n').map_or((body, ""), |i| body.split_at(i))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_keeps_line_break_in_remainder() {
        assert_eq!(split_first_line("a\nb\nc"), ("a", "\nb\nc"));
        assert_eq!(split_first_line("plain"), ("plain", ""));
        assert_eq!(split_first_line("\nx"), ("", "\nx"));
    }
}
