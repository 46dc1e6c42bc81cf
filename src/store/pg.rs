//! Postgres-backed [`Store`] on a pooled diesel connection.
//!
//! Every transaction sets a local `statement_timeout` so a stuck query aborts
//! that message instead of holding a worker indefinitely.

use super::{ReadingQuery, RetentionLimits, RetentionReport, Store, StoreError, StoreTx};
use crate::db::models::{
    Gateway, GatewayLiveness, GatewayStatus, NewGateway, NewNode, NewSensorReading, NewSite, Node, NodeLiveness,
    NodeStatus, SensorReading, Site,
};
use crate::schema;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::sql_types::{BigInt, Timestamptz};
use diesel::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::info;
use std::time::Duration;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

// Postgres caps bind parameters per statement; 8 columns * 1000 rows stays well below.
const INSERT_CHUNK: usize = 1000;

pub type PgPool = Pool<ConnectionManager<PgConnection>>;

pub struct PgStore {
    pool: PgPool,
    statement_timeout: Duration,
}

impl PgStore {
    /// Builds the pool. `timeout` bounds both connection checkout and every
    /// statement run through this store.
    pub fn connect(database_url: &str, pool_size: u32, timeout: Duration) -> Result<Self, StoreError> {
        let manager = ConnectionManager::<PgConnection>::new(database_url);
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .connection_timeout(timeout)
            .build(manager)
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(PgStore {
            pool,
            statement_timeout: timeout,
        })
    }

    pub fn apply_migrations(&self) -> Result<(), String> {
        let mut pooled = self.checkout().map_err(|e| e.to_string())?;
        let conn: &mut PgConnection = &mut pooled;
        match conn.run_pending_migrations(MIGRATIONS) {
            Ok(applied) => {
                if applied.is_empty() {
                    info!("Database schema is up to date; no migrations were applied");
                } else {
                    let names = applied.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
                    info!("Applied {} database migration(s): {}", applied.len(), names);
                }
                Ok(())
            }
            Err(e) => Err(format!("Applying database migrations failed: {}", e)),
        }
    }

    fn checkout(&self) -> Result<PooledConnection<ConnectionManager<PgConnection>>, StoreError> {
        self.pool.get().map_err(|e| StoreError::Connection(e.to_string()))
    }

    fn set_local_timeout(&self, conn: &mut PgConnection) -> Result<(), StoreError> {
        diesel::sql_query(format!(
            "SET LOCAL statement_timeout = {}",
            self.statement_timeout.as_millis()
        ))
        .execute(conn)?;
        Ok(())
    }
}

impl Store for PgStore {
    fn transaction<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut dyn StoreTx) -> Result<T, StoreError>,
    {
        let mut pooled = self.checkout()?;
        let conn: &mut PgConnection = &mut pooled;
        conn.transaction::<T, StoreError, _>(|conn| {
            self.set_local_timeout(conn)?;
            let mut tx = PgTx { conn };
            f(&mut tx)
        })
    }

    fn query_readings(&self, query: &ReadingQuery) -> Result<Vec<SensorReading>, StoreError> {
        use schema::gateways::dsl as G;
        use schema::nodes::dsl as N;
        use schema::sensor_readings::dsl as R;

        let mut pooled = self.checkout()?;
        let conn: &mut PgConnection = &mut pooled;

        conn.transaction::<_, StoreError, _>(|conn| {
            self.set_local_timeout(conn)?;

            let mut q = R::sensor_readings.select(SensorReading::as_select()).into_boxed();
            if let Some(node) = query.node_id {
                q = q.filter(R::node_id.eq(node));
            }
            if let Some(gateway) = query.gateway_id {
                q = q.filter(R::node_id.eq_any(N::nodes.filter(N::gateway_id.eq(gateway)).select(N::id)));
            }
            if let Some(site) = query.site_id {
                q = q.filter(
                    R::node_id.eq_any(
                        N::nodes
                            .inner_join(G::gateways)
                            .filter(G::site_id.eq(site))
                            .select(N::id),
                    ),
                );
            }
            if let Some(adc_type) = query.adc_type.as_deref() {
                q = q.filter(R::adc_type.eq(adc_type.to_string()));
            }
            if let Some(channel) = query.channel {
                q = q.filter(R::channel.eq(channel));
            }
            if let Some(from) = query.from {
                q = q.filter(R::timestamp.ge(from));
            }
            if let Some(to) = query.to {
                q = q.filter(R::timestamp.le(to));
            }

            q.order((R::timestamp.desc(), R::id.desc()))
                .limit(query.effective_limit())
                .load(conn)
                .map_err(StoreError::from)
        })
    }

    fn delete_readings_before(
        &self,
        cutoff: DateTime<Utc>,
        limits: &RetentionLimits,
    ) -> Result<RetentionReport, StoreError> {
        let mut pooled = self.checkout()?;
        let conn: &mut PgConnection = &mut pooled;

        // Row-level deletes in short transactions: concurrent appends only ever
        // wait on the batch currently in flight.
        super::delete_in_batches(cutoff, limits, |batch_size| {
            conn.transaction::<usize, StoreError, _>(|conn| {
                self.set_local_timeout(conn)?;
                diesel::sql_query(
                    "DELETE FROM sensor_readings WHERE id IN \
                     (SELECT id FROM sensor_readings WHERE \"timestamp\" < $1 LIMIT $2)",
                )
                .bind::<Timestamptz, _>(cutoff)
                .bind::<BigInt, _>(batch_size)
                .execute(conn)
                .map_err(StoreError::from)
            })
        })
    }
}

struct PgTx<'c> {
    conn: &'c mut PgConnection,
}

#[derive(AsChangeset)]
#[diesel(table_name = schema::nodes)]
struct NodeChanges<'a> {
    status: &'a str,
    last_seen: Option<DateTime<Utc>>,
    rssi: Option<i32>,
    battery_level: Option<f64>,
    last_qr_code: Option<&'a str>,
    updated_at: DateTime<Utc>,
}

impl StoreTx for PgTx<'_> {
    fn find_gateway_by_code(&mut self, code: &str) -> Result<Option<Gateway>, StoreError> {
        use schema::gateways::dsl as G;

        G::gateways
            .filter(G::gateway_code.eq(code))
            .select(Gateway::as_select())
            .for_update()
            .first(self.conn)
            .optional()
            .map_err(StoreError::from)
    }

    fn lookup_gateway_by_code(&mut self, code: &str) -> Result<Option<Gateway>, StoreError> {
        use schema::gateways::dsl as G;

        G::gateways
            .filter(G::gateway_code.eq(code))
            .select(Gateway::as_select())
            .first(self.conn)
            .optional()
            .map_err(StoreError::from)
    }

    fn find_gateway(&mut self, id: i64) -> Result<Option<Gateway>, StoreError> {
        use schema::gateways::dsl as G;

        G::gateways
            .find(id)
            .select(Gateway::as_select())
            .first(self.conn)
            .optional()
            .map_err(StoreError::from)
    }

    fn find_node(&mut self, gateway_id: i64, node_id: i32) -> Result<Option<Node>, StoreError> {
        use schema::nodes::dsl as N;

        N::nodes
            .filter(N::gateway_id.eq(gateway_id).and(N::node_id.eq(node_id)))
            .select(Node::as_select())
            .for_update()
            .first(self.conn)
            .optional()
            .map_err(StoreError::from)
    }

    fn find_node_by_pk(&mut self, id: i64) -> Result<Option<Node>, StoreError> {
        use schema::nodes::dsl as N;

        N::nodes
            .find(id)
            .select(Node::as_select())
            .first(self.conn)
            .optional()
            .map_err(StoreError::from)
    }

    fn list_gateways(&mut self) -> Result<Vec<Gateway>, StoreError> {
        use schema::gateways::dsl as G;

        G::gateways
            .select(Gateway::as_select())
            .order(G::gateway_code.asc())
            .load(self.conn)
            .map_err(StoreError::from)
    }

    fn list_nodes(&mut self, gateway_id: i64) -> Result<Vec<Node>, StoreError> {
        use schema::nodes::dsl as N;

        N::nodes
            .filter(N::gateway_id.eq(gateway_id))
            .select(Node::as_select())
            .order(N::node_id.asc())
            .load(self.conn)
            .map_err(StoreError::from)
    }

    fn touch_gateway(&mut self, id: i64, liveness: &GatewayLiveness) -> Result<(), StoreError> {
        use schema::gateways::dsl as G;

        diesel::update(G::gateways.find(id))
            .set((
                G::status.eq(liveness.status.as_str()),
                G::last_seen.eq(Some(liveness.last_seen)),
                G::updated_at.eq(Utc::now()),
            ))
            .execute(self.conn)?;
        Ok(())
    }

    fn touch_node(&mut self, id: i64, liveness: &NodeLiveness) -> Result<(), StoreError> {
        use schema::nodes::dsl as N;

        let changes = NodeChanges {
            status: liveness.status.as_str(),
            last_seen: Some(liveness.last_seen),
            rssi: liveness.rssi,
            battery_level: liveness.battery_level,
            last_qr_code: liveness.last_qr_code.as_deref(),
            updated_at: Utc::now(),
        };
        diesel::update(N::nodes.find(id)).set(&changes).execute(self.conn)?;
        Ok(())
    }

    fn demote_stale_gateways(&mut self, cutoff: DateTime<Utc>) -> Result<Vec<Gateway>, StoreError> {
        use schema::gateways::dsl as G;

        diesel::update(
            G::gateways
                .filter(G::status.eq(GatewayStatus::Online.as_str()))
                .filter(G::last_seen.lt(Some(cutoff)).or(G::last_seen.is_null())),
        )
        .set((
            G::status.eq(GatewayStatus::Offline.as_str()),
            G::updated_at.eq(Utc::now()),
        ))
        .returning(Gateway::as_returning())
        .get_results(self.conn)
        .map_err(StoreError::from)
    }

    fn demote_stale_nodes(&mut self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        use schema::nodes::dsl as N;

        diesel::update(
            N::nodes
                .filter(N::status.eq(NodeStatus::Online.as_str()))
                .filter(N::last_seen.lt(Some(cutoff)).or(N::last_seen.is_null())),
        )
        .set((N::status.eq(NodeStatus::Offline.as_str()), N::updated_at.eq(Utc::now())))
        .execute(self.conn)
        .map_err(StoreError::from)
    }

    fn append_readings(&mut self, rows: &[NewSensorReading]) -> Result<usize, StoreError> {
        use schema::sensor_readings::dsl as R;

        let mut inserted = 0;
        for chunk in rows.chunks(INSERT_CHUNK) {
            inserted += diesel::insert_into(R::sensor_readings)
                .values(chunk)
                .execute(self.conn)?;
        }
        Ok(inserted)
    }

    fn create_site(&mut self, site: &NewSite) -> Result<Site, StoreError> {
        use schema::sites::dsl as S;

        diesel::insert_into(S::sites)
            .values(site)
            .returning(Site::as_returning())
            .get_result(self.conn)
            .map_err(StoreError::from)
    }

    fn create_gateway(&mut self, gateway: &NewGateway) -> Result<Gateway, StoreError> {
        use schema::gateways::dsl as G;

        diesel::insert_into(G::gateways)
            .values(gateway)
            .returning(Gateway::as_returning())
            .get_result(self.conn)
            .map_err(StoreError::from)
    }

    fn create_node(&mut self, node: &NewNode) -> Result<Node, StoreError> {
        use schema::nodes::dsl as N;

        diesel::insert_into(N::nodes)
            .values(node)
            .returning(Node::as_returning())
            .get_result(self.conn)
            .map_err(StoreError::from)
    }

    fn reassign_node(&mut self, id: i64, gateway_id: i64) -> Result<Node, StoreError> {
        use schema::nodes::dsl as N;

        diesel::update(N::nodes.find(id))
            .set((N::gateway_id.eq(gateway_id), N::updated_at.eq(Utc::now())))
            .returning(Node::as_returning())
            .get_result(self.conn)
            .map_err(StoreError::from)
    }

    fn delete_site(&mut self, id: i64) -> Result<bool, StoreError> {
        use schema::sites::dsl as S;

        let removed = diesel::delete(S::sites.find(id)).execute(self.conn)?;
        Ok(removed > 0)
    }
}
