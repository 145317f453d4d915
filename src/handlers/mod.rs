use serde::{Deserialize, Serialize};

pub mod jobs;
pub mod live;

#[derive(Deserialize)]
pub struct Paging {
    limit: Option<i64>,
    offset: Option<i64>,
}

#[derive(Serialize)]
pub struct PagingResult<T> {
    limit: i64,
    offset: i64,
    data: Vec<T>,
}
