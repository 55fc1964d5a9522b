/// Predicate schema installed by `ourgraph --apply-schema`
///
/// Both identity keys are exact-indexed with `@upsert` so that concurrent
/// creations of the same key conflict instead of silently duplicating.
pub const SCHEMA: &str = r#"
url: string @index(exact) @upsert .
username: string @index(exact) @upsert .
name: string .
urls: [string] .
likes: [uid] @reverse @count .
title: string @index(term) .
author: string @index(term) .
desc: string @index(term) .
tags: [string] @index(term) .
image: string .
created: int .
updated: int .
reviews: int .
likecount: int .
wordcount: int .
chapters: int .
complete: bool .
isbn: int .
"#;
