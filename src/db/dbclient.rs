use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub struct DBClient {
    conn: PgPool,
}

impl DBClient {
    pub async fn new(url: &str) -> anyhow::Result<Self> {
        let conn = PgPoolOptions::new()
            .max_connections(8)
            .connect(url)
            .await?;

        Ok(Self { conn })
    }

    pub fn conn(&self) -> &PgPool {
        &self.conn
    }
}
