//! sqlx-backed Postgres [`Store`].
//!
//! Statements run in autocommit mode except inside a maintenance scope
//! opened with [`Store::begin`], which pins a pool connection and routes
//! every statement through its transaction until commit/rollback. This is
//! what gives each cleanup kind its own rollback-safe transaction while the
//! per-merge `flush` keeps write batches bounded.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::{
    Company, CompanyBranch, ContactAddress, ContactLink, ExtractionRun, JobPosting,
    KeywordConfigState, Location, RunStatus, Source,
};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::{Store, StoreError};

pub struct PgStore {
    pool: PgPool,
    scope: Mutex<Option<PoolConnection<Postgres>>>,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            scope: Mutex::new(None),
        }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|err| StoreError::Unrecoverable(format!("migration failed: {err}")))
    }

    async fn execute(&self, query: Query<'_, Postgres, PgArguments>) -> Result<u64, StoreError> {
        let mut scope = self.scope.lock().await;
        let result = match scope.as_mut() {
            Some(conn) => query.execute(&mut **conn).await?,
            None => query.execute(&self.pool).await?,
        };
        Ok(result.rows_affected())
    }

    async fn fetch_optional(
        &self,
        query: Query<'_, Postgres, PgArguments>,
    ) -> Result<Option<PgRow>, StoreError> {
        let mut scope = self.scope.lock().await;
        let row = match scope.as_mut() {
            Some(conn) => query.fetch_optional(&mut **conn).await?,
            None => query.fetch_optional(&self.pool).await?,
        };
        Ok(row)
    }

    async fn fetch_all(
        &self,
        query: Query<'_, Postgres, PgArguments>,
    ) -> Result<Vec<PgRow>, StoreError> {
        let mut scope = self.scope.lock().await;
        let rows = match scope.as_mut() {
            Some(conn) => query.fetch_all(&mut **conn).await?,
            None => query.fetch_all(&self.pool).await?,
        };
        Ok(rows)
    }

    async fn expect_updated(&self, id: Uuid, rows: u64) -> Result<(), StoreError> {
        if rows == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }
}

fn company_from_row(row: &PgRow) -> Result<Company, StoreError> {
    Ok(Company {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        website: row.try_get("website")?,
        founded_year: row.try_get("founded_year")?,
        industries: row.try_get("industries")?,
        employee_range: row.try_get("employee_range")?,
        social_links: row.try_get("social_links")?,
        last_seen_with_offer: row.try_get("last_seen_with_offer")?,
        created_at: row.try_get("created_at")?,
    })
}

fn location_from_row(row: &PgRow) -> Result<Location, StoreError> {
    Ok(Location {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        country: row.try_get("country")?,
        region: row.try_get("region")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        created_at: row.try_get("created_at")?,
    })
}

fn branch_from_row(row: &PgRow) -> Result<CompanyBranch, StoreError> {
    Ok(CompanyBranch {
        id: row.try_get("id")?,
        company_id: row.try_get("company_id")?,
        location_id: row.try_get("location_id")?,
        phone_numbers: row.try_get("phone_numbers")?,
        created_at: row.try_get("created_at")?,
    })
}

fn contact_from_row(row: &PgRow) -> Result<ContactAddress, StoreError> {
    Ok(ContactAddress {
        id: row.try_get("id")?,
        address: row.try_get("address")?,
        created_at: row.try_get("created_at")?,
    })
}

fn link_from_row(row: &PgRow) -> Result<ContactLink, StoreError> {
    Ok(ContactLink {
        company_id: row.try_get("company_id")?,
        address_id: row.try_get("address_id")?,
        usable_for_applications: row.try_get("usable_for_applications")?,
    })
}

fn posting_from_row(row: &PgRow) -> Result<JobPosting, StoreError> {
    let source: String = row.try_get("source")?;
    Ok(JobPosting {
        id: row.try_get("id")?,
        source: source.parse::<Source>().map_err(StoreError::Decode)?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        url: row.try_get("url")?,
        host: row.try_get("host")?,
        salary_min: row.try_get("salary_min")?,
        salary_max: row.try_get("salary_max")?,
        posted_at: row.try_get("posted_at")?,
        languages: row.try_get("languages")?,
        remote: row.try_get("remote")?,
        company_id: row.try_get("company_id")?,
        branch_id: row.try_get("branch_id")?,
        location_id: row.try_get("location_id")?,
        contact_address_id: row.try_get("contact_address_id")?,
        identity_hash: row.try_get("identity_hash")?,
        first_seen_run_id: row.try_get("first_seen_run_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn run_from_row(row: &PgRow) -> Result<ExtractionRun, StoreError> {
    let sources: Vec<String> = row.try_get("sources")?;
    let sources = sources
        .iter()
        .map(|s| s.parse::<Source>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(StoreError::Decode)?;
    let status: String = row.try_get("status")?;
    Ok(ExtractionRun {
        id: row.try_get("id")?,
        keywords: row.try_get("keywords")?,
        sources,
        requested_configurations: row.try_get("requested_configurations")?,
        country: row.try_get("country")?,
        location: row.try_get("location")?,
        distance_km: row.try_get::<Option<i32>, _>("distance_km")?.map(|v| v as u32),
        page_offset: row.try_get::<i32, _>("page_offset")? as u32,
        page_count: row.try_get::<i32, _>("page_count")? as u32,
        result_cap: row.try_get::<Option<i32>, _>("result_cap")?.map(|v| v as u32),
        found_count: row.try_get("found_count")?,
        new_count: row.try_get("new_count")?,
        bound_count: row.try_get("bound_count")?,
        status: status.parse::<RunStatus>().map_err(StoreError::Decode)?,
        percentage_done: row
            .try_get::<Option<i16>, _>("percentage_done")?
            .map(|v| v as u8),
        error_message: row.try_get("error_message")?,
        error_trace: row.try_get("error_trace")?,
        created_at: row.try_get("created_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

fn keyword_config_from_row(row: &PgRow) -> Result<KeywordConfigState, StoreError> {
    Ok(KeywordConfigState {
        run_id: row.try_get("run_id")?,
        keyword: row.try_get("keyword")?,
        configuration: row.try_get("configuration")?,
        handled: row.try_get("handled")?,
        found: row.try_get("found")?,
    })
}

fn source_strings(sources: &[Source]) -> Vec<String> {
    sources.iter().map(|s| s.to_string()).collect()
}

#[async_trait]
impl Store for PgStore {
    async fn insert_company(&self, company: &Company) -> Result<(), StoreError> {
        self.execute(
            sqlx::query(
                "INSERT INTO companies \
                 (id, name, website, founded_year, industries, employee_range, social_links, \
                  last_seen_with_offer, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(company.id)
            .bind(&company.name)
            .bind(&company.website)
            .bind(company.founded_year)
            .bind(&company.industries)
            .bind(&company.employee_range)
            .bind(&company.social_links)
            .bind(company.last_seen_with_offer)
            .bind(company.created_at),
        )
        .await?;
        Ok(())
    }

    async fn update_company(&self, company: &Company) -> Result<(), StoreError> {
        let rows = self
            .execute(
                sqlx::query(
                    "UPDATE companies SET name = $2, website = $3, founded_year = $4, \
                     industries = $5, employee_range = $6, social_links = $7, \
                     last_seen_with_offer = $8 WHERE id = $1",
                )
                .bind(company.id)
                .bind(&company.name)
                .bind(&company.website)
                .bind(company.founded_year)
                .bind(&company.industries)
                .bind(&company.employee_range)
                .bind(&company.social_links)
                .bind(company.last_seen_with_offer),
            )
            .await?;
        self.expect_updated(company.id, rows).await
    }

    async fn get_company(&self, id: Uuid) -> Result<Option<Company>, StoreError> {
        self.fetch_optional(sqlx::query("SELECT * FROM companies WHERE id = $1").bind(id))
            .await?
            .map(|row| company_from_row(&row))
            .transpose()
    }

    async fn companies_created_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Company>, StoreError> {
        self.fetch_all(
            sqlx::query("SELECT * FROM companies WHERE created_at >= $1 ORDER BY created_at")
                .bind(cutoff),
        )
        .await?
        .iter()
        .map(company_from_row)
        .collect()
    }

    async fn delete_company(&self, id: Uuid) -> Result<(), StoreError> {
        self.execute(sqlx::query("DELETE FROM companies WHERE id = $1").bind(id))
            .await?;
        Ok(())
    }

    async fn insert_location(&self, location: &Location) -> Result<(), StoreError> {
        self.execute(
            sqlx::query(
                "INSERT INTO locations \
                 (id, name, country, region, latitude, longitude, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(location.id)
            .bind(&location.name)
            .bind(&location.country)
            .bind(&location.region)
            .bind(location.latitude)
            .bind(location.longitude)
            .bind(location.created_at),
        )
        .await?;
        Ok(())
    }

    async fn update_location(&self, location: &Location) -> Result<(), StoreError> {
        let rows = self
            .execute(
                sqlx::query(
                    "UPDATE locations SET name = $2, country = $3, region = $4, \
                     latitude = $5, longitude = $6 WHERE id = $1",
                )
                .bind(location.id)
                .bind(&location.name)
                .bind(&location.country)
                .bind(&location.region)
                .bind(location.latitude)
                .bind(location.longitude),
            )
            .await?;
        self.expect_updated(location.id, rows).await
    }

    async fn get_location(&self, id: Uuid) -> Result<Option<Location>, StoreError> {
        self.fetch_optional(sqlx::query("SELECT * FROM locations WHERE id = $1").bind(id))
            .await?
            .map(|row| location_from_row(&row))
            .transpose()
    }

    async fn locations_created_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Location>, StoreError> {
        self.fetch_all(
            sqlx::query("SELECT * FROM locations WHERE created_at >= $1 ORDER BY created_at")
                .bind(cutoff),
        )
        .await?
        .iter()
        .map(location_from_row)
        .collect()
    }

    async fn delete_location(&self, id: Uuid) -> Result<(), StoreError> {
        self.execute(sqlx::query("DELETE FROM locations WHERE id = $1").bind(id))
            .await?;
        Ok(())
    }

    async fn insert_branch(&self, branch: &CompanyBranch) -> Result<(), StoreError> {
        self.execute(
            sqlx::query(
                "INSERT INTO company_branches \
                 (id, company_id, location_id, phone_numbers, created_at) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(branch.id)
            .bind(branch.company_id)
            .bind(branch.location_id)
            .bind(&branch.phone_numbers)
            .bind(branch.created_at),
        )
        .await?;
        Ok(())
    }

    async fn update_branch(&self, branch: &CompanyBranch) -> Result<(), StoreError> {
        let rows = self
            .execute(
                sqlx::query(
                    "UPDATE company_branches SET company_id = $2, location_id = $3, \
                     phone_numbers = $4 WHERE id = $1",
                )
                .bind(branch.id)
                .bind(branch.company_id)
                .bind(branch.location_id)
                .bind(&branch.phone_numbers),
            )
            .await?;
        self.expect_updated(branch.id, rows).await
    }

    async fn get_branch(&self, id: Uuid) -> Result<Option<CompanyBranch>, StoreError> {
        self.fetch_optional(sqlx::query("SELECT * FROM company_branches WHERE id = $1").bind(id))
            .await?
            .map(|row| branch_from_row(&row))
            .transpose()
    }

    async fn branches_created_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<CompanyBranch>, StoreError> {
        self.fetch_all(
            sqlx::query(
                "SELECT * FROM company_branches WHERE created_at >= $1 ORDER BY created_at",
            )
            .bind(cutoff),
        )
        .await?
        .iter()
        .map(branch_from_row)
        .collect()
    }

    async fn delete_branch(&self, id: Uuid) -> Result<(), StoreError> {
        self.execute(sqlx::query("DELETE FROM company_branches WHERE id = $1").bind(id))
            .await?;
        Ok(())
    }

    async fn reassign_branches_to_company(&self, from: Uuid, to: Uuid) -> Result<(), StoreError> {
        self.execute(
            sqlx::query("UPDATE company_branches SET company_id = $2 WHERE company_id = $1")
                .bind(from)
                .bind(to),
        )
        .await?;
        Ok(())
    }

    async fn reassign_branches_to_location(&self, from: Uuid, to: Uuid) -> Result<(), StoreError> {
        self.execute(
            sqlx::query("UPDATE company_branches SET location_id = $2 WHERE location_id = $1")
                .bind(from)
                .bind(to),
        )
        .await?;
        Ok(())
    }

    async fn insert_contact(&self, contact: &ContactAddress) -> Result<(), StoreError> {
        self.execute(
            sqlx::query(
                "INSERT INTO contact_addresses (id, address, created_at) VALUES ($1, $2, $3)",
            )
            .bind(contact.id)
            .bind(&contact.address)
            .bind(contact.created_at),
        )
        .await?;
        Ok(())
    }

    async fn get_contact(&self, id: Uuid) -> Result<Option<ContactAddress>, StoreError> {
        self.fetch_optional(sqlx::query("SELECT * FROM contact_addresses WHERE id = $1").bind(id))
            .await?
            .map(|row| contact_from_row(&row))
            .transpose()
    }

    async fn contacts_created_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ContactAddress>, StoreError> {
        self.fetch_all(
            sqlx::query(
                "SELECT * FROM contact_addresses WHERE created_at >= $1 ORDER BY created_at",
            )
            .bind(cutoff),
        )
        .await?
        .iter()
        .map(contact_from_row)
        .collect()
    }

    async fn delete_contact(&self, id: Uuid) -> Result<(), StoreError> {
        self.execute(sqlx::query("DELETE FROM contact_addresses WHERE id = $1").bind(id))
            .await?;
        Ok(())
    }

    async fn link_contact(&self, link: &ContactLink) -> Result<(), StoreError> {
        self.execute(
            sqlx::query(
                "INSERT INTO company_contact_links \
                 (company_id, address_id, usable_for_applications) VALUES ($1, $2, $3) \
                 ON CONFLICT (company_id, address_id) DO NOTHING",
            )
            .bind(link.company_id)
            .bind(link.address_id)
            .bind(link.usable_for_applications),
        )
        .await?;
        Ok(())
    }

    async fn contact_links_for_address(
        &self,
        address_id: Uuid,
    ) -> Result<Vec<ContactLink>, StoreError> {
        self.fetch_all(
            sqlx::query("SELECT * FROM company_contact_links WHERE address_id = $1")
                .bind(address_id),
        )
        .await?
        .iter()
        .map(link_from_row)
        .collect()
    }

    async fn reassign_contact_links_to_company(
        &self,
        from: Uuid,
        to: Uuid,
    ) -> Result<(), StoreError> {
        self.execute(
            sqlx::query(
                "INSERT INTO company_contact_links \
                 (company_id, address_id, usable_for_applications) \
                 SELECT $2, address_id, usable_for_applications \
                 FROM company_contact_links WHERE company_id = $1 \
                 ON CONFLICT (company_id, address_id) DO NOTHING",
            )
            .bind(from)
            .bind(to),
        )
        .await?;
        self.execute(
            sqlx::query("DELETE FROM company_contact_links WHERE company_id = $1").bind(from),
        )
        .await?;
        Ok(())
    }

    async fn reassign_contact_links_to_address(
        &self,
        from: Uuid,
        to: Uuid,
    ) -> Result<(), StoreError> {
        self.execute(
            sqlx::query(
                "INSERT INTO company_contact_links \
                 (company_id, address_id, usable_for_applications) \
                 SELECT company_id, $2, usable_for_applications \
                 FROM company_contact_links WHERE address_id = $1 \
                 ON CONFLICT (company_id, address_id) DO NOTHING",
            )
            .bind(from)
            .bind(to),
        )
        .await?;
        self.execute(
            sqlx::query("DELETE FROM company_contact_links WHERE address_id = $1").bind(from),
        )
        .await?;
        Ok(())
    }

    async fn insert_posting(&self, posting: &JobPosting) -> Result<(), StoreError> {
        self.execute(
            sqlx::query(
                "INSERT INTO job_postings \
                 (id, source, title, description, url, host, salary_min, salary_max, posted_at, \
                  languages, remote, company_id, branch_id, location_id, contact_address_id, \
                  identity_hash, first_seen_run_id, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
                  $17, $18)",
            )
            .bind(posting.id)
            .bind(posting.source.as_str())
            .bind(&posting.title)
            .bind(&posting.description)
            .bind(&posting.url)
            .bind(&posting.host)
            .bind(posting.salary_min)
            .bind(posting.salary_max)
            .bind(posting.posted_at)
            .bind(&posting.languages)
            .bind(posting.remote)
            .bind(posting.company_id)
            .bind(posting.branch_id)
            .bind(posting.location_id)
            .bind(posting.contact_address_id)
            .bind(&posting.identity_hash)
            .bind(posting.first_seen_run_id)
            .bind(posting.created_at),
        )
        .await?;
        Ok(())
    }

    async fn update_posting(&self, posting: &JobPosting) -> Result<(), StoreError> {
        // first_seen_run_id is immutable after creation and deliberately
        // excluded from the column list.
        let rows = self
            .execute(
                sqlx::query(
                    "UPDATE job_postings SET source = $2, title = $3, description = $4, \
                     url = $5, host = $6, salary_min = $7, salary_max = $8, posted_at = $9, \
                     languages = $10, remote = $11, company_id = $12, branch_id = $13, \
                     location_id = $14, contact_address_id = $15, identity_hash = $16 \
                     WHERE id = $1",
                )
                .bind(posting.id)
                .bind(posting.source.as_str())
                .bind(&posting.title)
                .bind(&posting.description)
                .bind(&posting.url)
                .bind(&posting.host)
                .bind(posting.salary_min)
                .bind(posting.salary_max)
                .bind(posting.posted_at)
                .bind(&posting.languages)
                .bind(posting.remote)
                .bind(posting.company_id)
                .bind(posting.branch_id)
                .bind(posting.location_id)
                .bind(posting.contact_address_id)
                .bind(&posting.identity_hash),
            )
            .await?;
        self.expect_updated(posting.id, rows).await
    }

    async fn get_posting(&self, id: Uuid) -> Result<Option<JobPosting>, StoreError> {
        self.fetch_optional(sqlx::query("SELECT * FROM job_postings WHERE id = $1").bind(id))
            .await?
            .map(|row| posting_from_row(&row))
            .transpose()
    }

    async fn delete_posting(&self, id: Uuid) -> Result<(), StoreError> {
        self.execute(sqlx::query("DELETE FROM job_postings WHERE id = $1").bind(id))
            .await?;
        Ok(())
    }

    async fn postings_created_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<JobPosting>, StoreError> {
        self.fetch_all(
            sqlx::query("SELECT * FROM job_postings WHERE created_at >= $1 ORDER BY created_at")
                .bind(cutoff),
        )
        .await?
        .iter()
        .map(posting_from_row)
        .collect()
    }

    async fn postings_for_runs(&self, run_ids: &[Uuid]) -> Result<Vec<JobPosting>, StoreError> {
        self.fetch_all(
            sqlx::query(
                "SELECT DISTINCT p.* FROM job_postings p \
                 JOIN run_postings rp ON rp.posting_id = p.id \
                 WHERE rp.run_id = ANY($1) ORDER BY p.created_at",
            )
            .bind(run_ids.to_vec()),
        )
        .await?
        .iter()
        .map(posting_from_row)
        .collect()
    }

    async fn find_posting_by_url(
        &self,
        url: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<JobPosting>, StoreError> {
        self.fetch_optional(
            sqlx::query(
                "SELECT * FROM job_postings WHERE url = $1 AND created_at >= $2 \
                 ORDER BY created_at DESC LIMIT 1",
            )
            .bind(url)
            .bind(cutoff),
        )
        .await?
        .map(|row| posting_from_row(&row))
        .transpose()
    }

    async fn find_posting_by_identity(
        &self,
        identity_hash: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<JobPosting>, StoreError> {
        self.fetch_optional(
            sqlx::query(
                "SELECT * FROM job_postings WHERE identity_hash = $1 AND created_at >= $2 \
                 ORDER BY created_at DESC LIMIT 1",
            )
            .bind(identity_hash)
            .bind(cutoff),
        )
        .await?
        .map(|row| posting_from_row(&row))
        .transpose()
    }

    async fn reassign_postings_to_company(&self, from: Uuid, to: Uuid) -> Result<(), StoreError> {
        self.execute(
            sqlx::query("UPDATE job_postings SET company_id = $2 WHERE company_id = $1")
                .bind(from)
                .bind(to),
        )
        .await?;
        Ok(())
    }

    async fn reassign_postings_to_branch(&self, from: Uuid, to: Uuid) -> Result<(), StoreError> {
        self.execute(
            sqlx::query("UPDATE job_postings SET branch_id = $2 WHERE branch_id = $1")
                .bind(from)
                .bind(to),
        )
        .await?;
        Ok(())
    }

    async fn reassign_postings_to_location(&self, from: Uuid, to: Uuid) -> Result<(), StoreError> {
        self.execute(
            sqlx::query("UPDATE job_postings SET location_id = $2 WHERE location_id = $1")
                .bind(from)
                .bind(to),
        )
        .await?;
        Ok(())
    }

    async fn reassign_postings_to_contact(&self, from: Uuid, to: Uuid) -> Result<(), StoreError> {
        self.execute(
            sqlx::query(
                "UPDATE job_postings SET contact_address_id = $2 WHERE contact_address_id = $1",
            )
            .bind(from)
            .bind(to),
        )
        .await?;
        Ok(())
    }

    async fn bind_run_posting(&self, run_id: Uuid, posting_id: Uuid) -> Result<(), StoreError> {
        self.execute(
            sqlx::query(
                "INSERT INTO run_postings (run_id, posting_id) VALUES ($1, $2) \
                 ON CONFLICT DO NOTHING",
            )
            .bind(run_id)
            .bind(posting_id),
        )
        .await?;
        Ok(())
    }

    async fn run_ids_for_posting(&self, posting_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let rows = self
            .fetch_all(
                sqlx::query("SELECT run_id FROM run_postings WHERE posting_id = $1")
                    .bind(posting_id),
            )
            .await?;
        rows.iter()
            .map(|row| row.try_get("run_id").map_err(StoreError::from))
            .collect()
    }

    async fn rebind_posting_runs(&self, from: Uuid, to: Uuid) -> Result<(), StoreError> {
        self.execute(
            sqlx::query(
                "INSERT INTO run_postings (run_id, posting_id) \
                 SELECT run_id, $2 FROM run_postings WHERE posting_id = $1 \
                 ON CONFLICT DO NOTHING",
            )
            .bind(from)
            .bind(to),
        )
        .await?;
        self.execute(sqlx::query("DELETE FROM run_postings WHERE posting_id = $1").bind(from))
            .await?;
        Ok(())
    }

    async fn bind_keyword_posting(
        &self,
        run_id: Uuid,
        keyword: &str,
        posting_id: Uuid,
    ) -> Result<(), StoreError> {
        self.execute(
            sqlx::query(
                "INSERT INTO run_keyword_postings (run_id, keyword, posting_id) \
                 VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
            )
            .bind(run_id)
            .bind(keyword)
            .bind(posting_id),
        )
        .await?;
        Ok(())
    }

    async fn rebind_keyword_postings(&self, from: Uuid, to: Uuid) -> Result<(), StoreError> {
        self.execute(
            sqlx::query(
                "INSERT INTO run_keyword_postings (run_id, keyword, posting_id) \
                 SELECT run_id, keyword, $2 FROM run_keyword_postings WHERE posting_id = $1 \
                 ON CONFLICT DO NOTHING",
            )
            .bind(from)
            .bind(to),
        )
        .await?;
        self.execute(
            sqlx::query("DELETE FROM run_keyword_postings WHERE posting_id = $1").bind(from),
        )
        .await?;
        Ok(())
    }

    async fn insert_run(&self, run: &ExtractionRun) -> Result<(), StoreError> {
        self.execute(
            sqlx::query(
                "INSERT INTO extraction_runs \
                 (id, keywords, sources, requested_configurations, country, location, \
                  distance_km, page_offset, page_count, result_cap, found_count, new_count, \
                  bound_count, status, percentage_done, error_message, error_trace, created_at, \
                  finished_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
                  $17, $18, $19)",
            )
            .bind(run.id)
            .bind(&run.keywords)
            .bind(source_strings(&run.sources))
            .bind(&run.requested_configurations)
            .bind(&run.country)
            .bind(&run.location)
            .bind(run.distance_km.map(|v| v as i32))
            .bind(run.page_offset as i32)
            .bind(run.page_count as i32)
            .bind(run.result_cap.map(|v| v as i32))
            .bind(run.found_count)
            .bind(run.new_count)
            .bind(run.bound_count)
            .bind(run.status.as_str())
            .bind(run.percentage_done.map(|v| v as i16))
            .bind(&run.error_message)
            .bind(&run.error_trace)
            .bind(run.created_at)
            .bind(run.finished_at),
        )
        .await?;
        Ok(())
    }

    async fn active_extraction_runs(&self, since: DateTime<Utc>) -> Result<i64, StoreError> {
        let row = self
            .fetch_optional(
                sqlx::query(
                    "SELECT COUNT(*) AS active FROM extraction_runs \
                     WHERE status = 'IN_PROGRESS' AND created_at >= $1",
                )
                .bind(since),
            )
            .await?;
        match row {
            Some(row) => Ok(row.try_get("active")?),
            None => Ok(0),
        }
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<ExtractionRun>, StoreError> {
        self.fetch_optional(sqlx::query("SELECT * FROM extraction_runs WHERE id = $1").bind(id))
            .await?
            .map(|row| run_from_row(&row))
            .transpose()
    }

    async fn update_run(&self, run: &ExtractionRun) -> Result<(), StoreError> {
        let rows = self
            .execute(
                sqlx::query(
                    "UPDATE extraction_runs SET keywords = $2, sources = $3, \
                     requested_configurations = $4, country = $5, location = $6, \
                     distance_km = $7, page_offset = $8, page_count = $9, result_cap = $10, \
                     found_count = $11, new_count = $12, bound_count = $13, status = $14, \
                     percentage_done = $15, error_message = $16, error_trace = $17, \
                     finished_at = $18 WHERE id = $1",
                )
                .bind(run.id)
                .bind(&run.keywords)
                .bind(source_strings(&run.sources))
                .bind(&run.requested_configurations)
                .bind(&run.country)
                .bind(&run.location)
                .bind(run.distance_km.map(|v| v as i32))
                .bind(run.page_offset as i32)
                .bind(run.page_count as i32)
                .bind(run.result_cap.map(|v| v as i32))
                .bind(run.found_count)
                .bind(run.new_count)
                .bind(run.bound_count)
                .bind(run.status.as_str())
                .bind(run.percentage_done.map(|v| v as i16))
                .bind(&run.error_message)
                .bind(&run.error_trace)
                .bind(run.finished_at),
            )
            .await?;
        self.expect_updated(run.id, rows).await
    }

    async fn upsert_keyword_config(&self, state: &KeywordConfigState) -> Result<(), StoreError> {
        self.execute(
            sqlx::query(
                "INSERT INTO run_keyword_configs (run_id, keyword, configuration, handled, found) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (run_id, keyword, configuration) \
                 DO UPDATE SET handled = EXCLUDED.handled, found = EXCLUDED.found",
            )
            .bind(state.run_id)
            .bind(&state.keyword)
            .bind(&state.configuration)
            .bind(state.handled)
            .bind(state.found),
        )
        .await?;
        Ok(())
    }

    async fn keyword_configs(&self, run_id: Uuid) -> Result<Vec<KeywordConfigState>, StoreError> {
        self.fetch_all(
            sqlx::query(
                "SELECT * FROM run_keyword_configs WHERE run_id = $1 \
                 ORDER BY keyword, configuration",
            )
            .bind(run_id),
        )
        .await?
        .iter()
        .map(keyword_config_from_row)
        .collect()
    }

    async fn peer_keyword_average(
        &self,
        keyword: &str,
        capped: bool,
        exclude_run: Uuid,
    ) -> Result<Option<f64>, StoreError> {
        let row = self
            .fetch_optional(
                sqlx::query(
                    "SELECT AVG(per_run.found)::DOUBLE PRECISION AS avg_found FROM ( \
                       SELECT kc.run_id, SUM(kc.found) AS found \
                       FROM run_keyword_configs kc \
                       JOIN extraction_runs r ON r.id = kc.run_id \
                       WHERE kc.keyword = $1 AND r.id <> $2 \
                         AND (r.result_cap IS NOT NULL) = $3 \
                       GROUP BY kc.run_id \
                     ) per_run",
                )
                .bind(keyword)
                .bind(exclude_run)
                .bind(capped),
            )
            .await?;
        match row {
            Some(row) => Ok(row.try_get("avg_found")?),
            None => Ok(None),
        }
    }

    async fn flush(&self) -> Result<(), StoreError> {
        // Statements are issued eagerly (autocommit or the open maintenance
        // transaction), so the barrier itself has nothing left to write.
        Ok(())
    }

    async fn begin(&self) -> Result<(), StoreError> {
        let mut scope = self.scope.lock().await;
        if scope.is_some() {
            return Err(StoreError::Unrecoverable(
                "maintenance scope already open".into(),
            ));
        }
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN").execute(&mut *conn).await?;
        *scope = Some(conn);
        debug!("maintenance scope opened");
        Ok(())
    }

    async fn commit(&self) -> Result<(), StoreError> {
        let mut scope = self.scope.lock().await;
        match scope.take() {
            Some(mut conn) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(())
            }
            None => Err(StoreError::Unrecoverable("commit without begin".into())),
        }
    }

    async fn rollback(&self) -> Result<(), StoreError> {
        let mut scope = self.scope.lock().await;
        if let Some(mut conn) = scope.take() {
            sqlx::query("ROLLBACK").execute(&mut *conn).await?;
            debug!("maintenance scope rolled back");
        }
        Ok(())
    }

    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let expires_at =
            Utc::now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
        let rows = self
            .execute(
                sqlx::query(
                    "INSERT INTO maintenance_leases (name, holder, expires_at) \
                     VALUES ($1, $2, $3) \
                     ON CONFLICT (name) DO UPDATE \
                     SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at \
                     WHERE maintenance_leases.expires_at <= now() \
                        OR maintenance_leases.holder = EXCLUDED.holder",
                )
                .bind(name)
                .bind(holder)
                .bind(expires_at),
            )
            .await?;
        Ok(rows > 0)
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<(), StoreError> {
        self.execute(
            sqlx::query("DELETE FROM maintenance_leases WHERE name = $1 AND holder = $2")
                .bind(name)
                .bind(holder),
        )
        .await?;
        Ok(())
    }

    async fn lease_holder(&self, name: &str) -> Result<Option<String>, StoreError> {
        let row = self
            .fetch_optional(
                sqlx::query(
                    "SELECT holder FROM maintenance_leases \
                     WHERE name = $1 AND expires_at > now()",
                )
                .bind(name),
            )
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get("holder")?)),
            None => Ok(None),
        }
    }
}
