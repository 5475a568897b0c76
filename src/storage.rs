use crate::billing::UsageLog;
use crate::directory::Directory;
use crate::ledger::{next_entry, Account, Ledger, LedgerError, LedgerQuery};
use crate::model::{
    CandidateView, Client, ClientSecret, Grant, LedgerAction, LedgerEntry, Model, Role,
    UsageRecord, User,
};
use crate::permissions::{diff_grants, GrantDiff};
use crate::util::now_ms;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sled::transaction::{
    ConflictableTransactionError, TransactionError, TransactionResult, TransactionalTree,
};
use sled::Transactional;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Embedded store for the directory, both ledgers and the usage log.
pub struct Store {
    db: sled::Db,
    clients: sled::Tree,
    client_names: sled::Tree,
    models: sled::Tree,
    /// client id (BE) ++ model name -> model id
    model_index: sled::Tree,
    users: sled::Tree,
    user_keys: sled::Tree,
    user_emails: sled::Tree,
    /// user id -> sorted grant list
    grants: sled::Tree,
    /// account key ++ seq (BE) -> entry
    ledger: sled::Tree,
    /// account key -> latest seq + remaining
    ledger_heads: sled::Tree,
    usage: sled::Tree,
}

/// Why an administrative write was not applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejected {
    NotFound,
    Duplicate(&'static str),
}

#[derive(Serialize, Deserialize)]
struct LedgerHead {
    seq: u64,
    remaining: i64,
}

/// Pre-encoded `initial` entry for an account created in the same transaction.
struct Baseline {
    head_key: [u8; 9],
    entry_key: Vec<u8>,
    entry: Vec<u8>,
    head: Vec<u8>,
}

impl Baseline {
    fn new(account: Account, entry_id: u64, reason: &str) -> anyhow::Result<Self> {
        let entry = next_entry(account, None, entry_id, 0, LedgerAction::Initial, reason, now_ms())?;
        let head_key = account.key();
        Ok(Self {
            entry_key: ledger_key(&head_key, entry.seq),
            head: serde_json::to_vec(&LedgerHead {
                seq: entry.seq,
                remaining: entry.remaining,
            })?,
            entry: serde_json::to_vec(&entry)?,
            head_key,
        })
    }

    fn write<E>(
        &self,
        heads: &TransactionalTree,
        entries: &TransactionalTree,
    ) -> Result<(), ConflictableTransactionError<E>> {
        entries.insert(self.entry_key.as_slice(), self.entry.as_slice())?;
        heads.insert(&self.head_key[..], self.head.as_slice())?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewClient {
    pub name: String,
    pub api_key: String,
    pub endpoint: String,
    pub weight: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientUpdate {
    pub api_key: Option<String>,
    pub endpoint: Option<String>,
    pub weight: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewModel {
    pub name: String,
    #[serde(default)]
    pub max_tokens: u64,
    pub prompt_price: i64,
    pub completion_price: i64,
    pub rpm_limit: Option<u32>,
    pub tpm_limit: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub role: Role,
    pub language: String,
    pub allow_ips: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserUpdate {
    pub email: Option<String>,
    pub language: Option<String>,
    pub allow_ips: Option<Vec<String>>,
}

#[inline]
fn id_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

fn model_index_key(client_id: u64, name: &str) -> Vec<u8> {
    let mut k = Vec::with_capacity(8 + name.len());
    k.extend_from_slice(&client_id.to_be_bytes());
    k.extend_from_slice(name.as_bytes());
    k
}

fn ledger_key(account: &[u8; 9], seq: u64) -> Vec<u8> {
    let mut k = Vec::with_capacity(17);
    k.extend_from_slice(account);
    k.extend_from_slice(&seq.to_be_bytes());
    k
}

fn decode<T: DeserializeOwned>(raw: &[u8]) -> anyhow::Result<T> {
    Ok(serde_json::from_slice(raw)?)
}

fn decode_id(raw: &[u8]) -> anyhow::Result<u64> {
    let arr: [u8; 8] = raw
        .try_into()
        .map_err(|_| anyhow::anyhow!("invalid id record of {} bytes", raw.len()))?;
    Ok(u64::from_be_bytes(arr))
}

/// Unwraps a sled transaction result whose abort type is [`Rejected`].
fn settle_rejectable<T>(res: TransactionResult<T, Rejected>) -> anyhow::Result<Result<T, Rejected>> {
    match res {
        Ok(v) => Ok(Ok(v)),
        Err(TransactionError::Abort(r)) => Ok(Err(r)),
        Err(TransactionError::Storage(e)) => Err(e.into()),
    }
}

fn abort_corrupt<E: std::fmt::Display>(e: E) -> ConflictableTransactionError<LedgerError> {
    ConflictableTransactionError::Abort(LedgerError::Corrupt(e.to_string()))
}

impl Store {
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db = sled::open(data_dir.join("tollgate_db"))?;
        Self::from_db(db)
    }

    /// In-memory database, discarded on drop.
    pub fn temporary() -> anyhow::Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> anyhow::Result<Self> {
        Ok(Self {
            clients: db.open_tree("clients")?,
            client_names: db.open_tree("client_names")?,
            models: db.open_tree("models")?,
            model_index: db.open_tree("model_index")?,
            users: db.open_tree("users")?,
            user_keys: db.open_tree("user_keys")?,
            user_emails: db.open_tree("user_emails")?,
            grants: db.open_tree("grants")?,
            ledger: db.open_tree("ledger")?,
            ledger_heads: db.open_tree("ledger_heads")?,
            usage: db.open_tree("usage")?,
            db,
        })
    }

    pub fn flush(&self) -> anyhow::Result<()> {
        self.db.flush()?;
        Ok(())
    }

    // ---- clients ----

    /// Creates the client, its name index and its `initial` ledger entry in
    /// one transaction.
    pub fn create_client(&self, new: NewClient) -> anyhow::Result<Result<Client, Rejected>> {
        let id = self.db.generate_id()?;
        let baseline = Baseline::new(Account::Client(id), self.db.generate_id()?, "client created")?;
        let now = now_ms();
        let client = Client {
            id,
            name: new.name,
            api_key: new.api_key,
            endpoint: new.endpoint,
            weight: new.weight,
            created_at_ms: now,
            updated_at_ms: now,
        };
        let encoded = serde_json::to_vec(&client)?;
        let res: TransactionResult<(), Rejected> = (
            &self.client_names,
            &self.clients,
            &self.ledger_heads,
            &self.ledger,
        )
            .transaction(|(names, clients, heads, entries)| {
                if names.get(client.name.as_bytes())?.is_some() {
                    return Err(ConflictableTransactionError::Abort(Rejected::Duplicate("client name")));
                }
                names.insert(client.name.as_bytes(), &id_key(id)[..])?;
                clients.insert(&id_key(id)[..], encoded.as_slice())?;
                baseline.write(heads, entries)?;
                Ok(())
            });
        if let Err(r) = settle_rejectable(res)? {
            return Ok(Err(r));
        }
        Ok(Ok(client))
    }

    pub fn get_client(&self, id: u64) -> anyhow::Result<Option<Client>> {
        match self.clients.get(id_key(id))? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn client_by_name(&self, name: &str) -> anyhow::Result<Option<Client>> {
        match self.client_names.get(name.as_bytes())? {
            Some(raw) => self.get_client(decode_id(&raw)?),
            None => Ok(None),
        }
    }

    pub fn list_clients(&self) -> anyhow::Result<Vec<Client>> {
        let mut out = Vec::with_capacity(self.clients.len());
        for item in self.clients.iter() {
            let (_k, v) = item?;
            out.push(decode(&v)?);
        }
        Ok(out)
    }

    pub fn update_client(&self, id: u64, update: ClientUpdate) -> anyhow::Result<Option<Client>> {
        let res = self.clients.transaction(|tx| {
            let Some(raw) = tx.get(id_key(id))? else {
                return Ok(None);
            };
            let mut client: Client = serde_json::from_slice(&raw)
                .map_err(|e| ConflictableTransactionError::Abort(e.to_string()))?;
            if let Some(k) = &update.api_key {
                client.api_key = k.clone();
            }
            if let Some(e) = &update.endpoint {
                client.endpoint = e.clone();
            }
            if let Some(w) = update.weight {
                client.weight = w;
            }
            client.updated_at_ms = now_ms();
            let encoded = serde_json::to_vec(&client)
                .map_err(|e| ConflictableTransactionError::Abort(e.to_string()))?;
            tx.insert(&id_key(id)[..], encoded)?;
            Ok(Some(client))
        });
        match res {
            Ok(v) => Ok(v),
            Err(TransactionError::Abort(msg)) => Err(anyhow::anyhow!("corrupt client record: {msg}")),
            Err(TransactionError::Storage(e)) => Err(e.into()),
        }
    }

    // ---- models ----

    /// Inserts a model or updates the one with the same name under this client.
    pub fn upsert_model(&self, client_id: u64, new: NewModel) -> anyhow::Result<Result<Model, Rejected>> {
        if self.get_client(client_id)?.is_none() {
            return Ok(Err(Rejected::NotFound));
        }
        let fresh_id = self.db.generate_id()?;
        let index_key = model_index_key(client_id, &new.name);
        let res: TransactionResult<Model, Rejected> =
            (&self.model_index, &self.models).transaction(|(index, models)| {
                let id = match index.get(&index_key)? {
                    Some(raw) => {
                        let arr = <[u8; 8]>::try_from(&raw[..])
                            .map_err(|_| ConflictableTransactionError::Abort(Rejected::NotFound))?;
                        u64::from_be_bytes(arr)
                    }
                    None => {
                        index.insert(index_key.clone(), &id_key(fresh_id)[..])?;
                        fresh_id
                    }
                };
                let model = Model {
                    id,
                    client_id,
                    name: new.name.clone(),
                    max_tokens: new.max_tokens,
                    prompt_price: new.prompt_price,
                    completion_price: new.completion_price,
                    rpm_limit: new.rpm_limit,
                    tpm_limit: new.tpm_limit,
                    updated_at_ms: now_ms(),
                };
                let encoded = serde_json::to_vec(&model)
                    .map_err(|_| ConflictableTransactionError::Abort(Rejected::NotFound))?;
                models.insert(&id_key(id)[..], encoded)?;
                Ok(model)
            });
        settle_rejectable(res)
    }

    pub fn get_model(&self, id: u64) -> anyhow::Result<Option<Model>> {
        match self.models.get(id_key(id))? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    // ---- users ----

    /// Creates the user under `api_key` together with its `initial` ledger
    /// entry; nothing is written when the email or key is taken.
    pub fn create_user(&self, new: NewUser, api_key: &str) -> anyhow::Result<Result<User, Rejected>> {
        let id = self.db.generate_id()?;
        let baseline = Baseline::new(Account::User(id), self.db.generate_id()?, "user created")?;
        let now = now_ms();
        let user = User {
            id,
            api_key: api_key.to_string(),
            email: new.email,
            role: new.role,
            language: new.language,
            allow_ips: new.allow_ips,
            created_at_ms: now,
            updated_at_ms: now,
        };
        let encoded = serde_json::to_vec(&user)?;
        let res: TransactionResult<(), Rejected> =
            (
                &self.users,
                &self.user_keys,
                &self.user_emails,
                &self.ledger_heads,
                &self.ledger,
            )
                .transaction(|(users, keys, emails, heads, entries)| {
                    if emails.get(user.email.as_bytes())?.is_some() {
                        return Err(ConflictableTransactionError::Abort(Rejected::Duplicate("email")));
                    }
                    if keys.get(user.api_key.as_bytes())?.is_some() {
                        return Err(ConflictableTransactionError::Abort(Rejected::Duplicate("api key")));
                    }
                    emails.insert(user.email.as_bytes(), &id_key(id)[..])?;
                    keys.insert(user.api_key.as_bytes(), &id_key(id)[..])?;
                    users.insert(&id_key(id)[..], encoded.as_slice())?;
                    baseline.write(heads, entries)?;
                    Ok(())
                });
        if let Err(r) = settle_rejectable(res)? {
            return Ok(Err(r));
        }
        Ok(Ok(user))
    }

    pub fn get_user(&self, id: u64) -> anyhow::Result<Option<User>> {
        match self.users.get(id_key(id))? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn list_users(&self) -> anyhow::Result<Vec<User>> {
        let mut out = Vec::with_capacity(self.users.len());
        for item in self.users.iter() {
            let (_k, v) = item?;
            out.push(decode(&v)?);
        }
        Ok(out)
    }

    pub fn update_user(&self, id: u64, update: UserUpdate) -> anyhow::Result<Result<User, Rejected>> {
        let res: TransactionResult<User, Rejected> =
            (&self.users, &self.user_emails).transaction(|(users, emails)| {
                let Some(raw) = users.get(id_key(id))? else {
                    return Err(ConflictableTransactionError::Abort(Rejected::NotFound));
                };
                let mut user: User = serde_json::from_slice(&raw)
                    .map_err(|_| ConflictableTransactionError::Abort(Rejected::NotFound))?;
                if let Some(email) = &update.email {
                    if *email != user.email {
                        if emails.get(email.as_bytes())?.is_some() {
                            return Err(ConflictableTransactionError::Abort(Rejected::Duplicate("email")));
                        }
                        emails.remove(user.email.as_bytes())?;
                        emails.insert(email.as_bytes(), &id_key(id)[..])?;
                        user.email = email.clone();
                    }
                }
                if let Some(lang) = &update.language {
                    user.language = lang.clone();
                }
                if let Some(ips) = &update.allow_ips {
                    user.allow_ips = ips.clone();
                }
                user.updated_at_ms = now_ms();
                let encoded = serde_json::to_vec(&user)
                    .map_err(|_| ConflictableTransactionError::Abort(Rejected::NotFound))?;
                users.insert(&id_key(id)[..], encoded)?;
                Ok(user)
            });
        settle_rejectable(res)
    }

    /// Swaps the user's key; the old key stops resolving in the same step.
    pub fn refresh_user_key(&self, id: u64, new_key: &str) -> anyhow::Result<Result<User, Rejected>> {
        let res: TransactionResult<User, Rejected> =
            (&self.users, &self.user_keys).transaction(|(users, keys)| {
                let Some(raw) = users.get(id_key(id))? else {
                    return Err(ConflictableTransactionError::Abort(Rejected::NotFound));
                };
                let mut user: User = serde_json::from_slice(&raw)
                    .map_err(|_| ConflictableTransactionError::Abort(Rejected::NotFound))?;
                if keys.get(new_key.as_bytes())?.is_some() {
                    return Err(ConflictableTransactionError::Abort(Rejected::Duplicate("api key")));
                }
                keys.remove(user.api_key.as_bytes())?;
                keys.insert(new_key.as_bytes(), &id_key(id)[..])?;
                user.api_key = new_key.to_string();
                user.updated_at_ms = now_ms();
                let encoded = serde_json::to_vec(&user)
                    .map_err(|_| ConflictableTransactionError::Abort(Rejected::NotFound))?;
                users.insert(&id_key(id)[..], encoded)?;
                Ok(user)
            });
        settle_rejectable(res)
    }

    // ---- usage ----

    pub fn recent_usage(&self, limit: usize) -> anyhow::Result<Vec<UsageRecord>> {
        let mut out = Vec::with_capacity(limit.min(self.usage.len()));
        for item in self.usage.iter().rev().take(limit) {
            let (_k, v) = item?;
            out.push(decode(&v)?);
        }
        Ok(out)
    }

    pub fn usage_count(&self) -> usize {
        self.usage.len()
    }

    fn balance_or_zero(&self, account: Account) -> anyhow::Result<i64> {
        match self.balance(account) {
            Ok(b) => Ok(b.unwrap_or(0)),
            Err(LedgerError::Storage(e)) => Err(e),
            Err(e) => Err(anyhow::anyhow!(e)),
        }
    }
}

impl Ledger for Store {
    fn append(
        &self,
        account: Account,
        change: i64,
        action: LedgerAction,
        reason: &str,
    ) -> Result<LedgerEntry, LedgerError> {
        let id = self
            .db
            .generate_id()
            .map_err(|e| LedgerError::Storage(e.into()))?;
        let acct = account.key();

        let res: TransactionResult<LedgerEntry, LedgerError> =
            (&self.ledger_heads, &self.ledger).transaction(|(heads, entries)| {
                let prev = match heads.get(acct)? {
                    Some(raw) => {
                        let head: LedgerHead = serde_json::from_slice(&raw).map_err(abort_corrupt)?;
                        Some((head.seq, head.remaining))
                    }
                    None => None,
                };
                let entry = next_entry(account, prev, id, change, action, reason, now_ms())
                    .map_err(ConflictableTransactionError::Abort)?;
                let encoded = serde_json::to_vec(&entry).map_err(abort_corrupt)?;
                let head = serde_json::to_vec(&LedgerHead {
                    seq: entry.seq,
                    remaining: entry.remaining,
                })
                .map_err(abort_corrupt)?;
                entries.insert(ledger_key(&acct, entry.seq), encoded)?;
                heads.insert(&acct[..], head)?;
                Ok(entry)
            });

        match res {
            Ok(entry) => Ok(entry),
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(LedgerError::Storage(e.into())),
        }
    }

    fn balance(&self, account: Account) -> Result<Option<i64>, LedgerError> {
        let raw = self
            .ledger_heads
            .get(account.key())
            .map_err(|e| LedgerError::Storage(e.into()))?;
        match raw {
            Some(raw) => {
                let head: LedgerHead =
                    serde_json::from_slice(&raw).map_err(|e| LedgerError::Corrupt(e.to_string()))?;
                Ok(Some(head.remaining))
            }
            None => Ok(None),
        }
    }

    fn entries(&self, account: Account, query: &LedgerQuery) -> Result<Vec<LedgerEntry>, LedgerError> {
        let mut out = Vec::new();
        let mut skip = query.page.saturating_mul(query.page_size);
        for item in self.ledger.scan_prefix(account.key()) {
            let (_k, v) = item.map_err(|e| LedgerError::Storage(e.into()))?;
            let entry: LedgerEntry =
                serde_json::from_slice(&v).map_err(|e| LedgerError::Corrupt(e.to_string()))?;
            if !query.matches(&entry) {
                continue;
            }
            if skip > 0 {
                skip -= 1;
                continue;
            }
            out.push(entry);
            if out.len() >= query.page_size {
                break;
            }
        }
        Ok(out)
    }
}

impl UsageLog for Store {
    fn record(&self, mut record: UsageRecord) -> anyhow::Result<UsageRecord> {
        record.id = self.db.generate_id()?;
        self.usage.insert(id_key(record.id), serde_json::to_vec(&record)?)?;
        Ok(record)
    }
}

impl Directory for Store {
    fn find_user_by_key(&self, api_key: &str) -> anyhow::Result<Option<User>> {
        match self.user_keys.get(api_key.as_bytes())? {
            Some(raw) => self.get_user(decode_id(&raw)?),
            None => Ok(None),
        }
    }

    fn find_candidates(&self, model_name: &str, api_key: &str) -> anyhow::Result<Vec<CandidateView>> {
        let Some(user) = self.find_user_by_key(api_key)? else {
            return Ok(Vec::new());
        };
        let user_balance = self.balance_or_zero(Account::User(user.id))?;

        let mut out = Vec::new();
        for grant in self.grants(user.id)? {
            let Some(model) = self.get_model(grant.model_id)? else {
                continue;
            };
            if model.name != model_name || model.client_id != grant.client_id {
                continue;
            }
            let Some(client) = self.get_client(grant.client_id)? else {
                continue;
            };
            let client_balance = self.balance_or_zero(Account::Client(client.id))?;
            if client_balance <= 0 {
                continue;
            }
            out.push(CandidateView {
                client_id: client.id,
                client_balance,
                client_weight: client.weight,
                user_id: user.id,
                user_balance,
                user_role: user.role,
                model_id: model.id,
                model_name: model.name,
                model_max_tokens: model.max_tokens,
                prompt_price: model.prompt_price,
                completion_price: model.completion_price,
            });
        }
        Ok(out)
    }

    fn find_client_secret(&self, client_id: u64) -> anyhow::Result<Option<ClientSecret>> {
        Ok(self.get_client(client_id)?.map(|c| ClientSecret {
            client_id: c.id,
            api_key: c.api_key,
            endpoint: c.endpoint,
        }))
    }

    fn list_models_for_client(&self, client_id: u64) -> anyhow::Result<Vec<Model>> {
        let mut out = Vec::new();
        for item in self.model_index.scan_prefix(client_id.to_be_bytes()) {
            let (_k, v) = item?;
            if let Some(m) = self.get_model(decode_id(&v)?)? {
                out.push(m);
            }
        }
        Ok(out)
    }

    fn list_models_for_key(&self, api_key: &str) -> anyhow::Result<Vec<Model>> {
        let Some(user) = self.find_user_by_key(api_key)? else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for grant in self.grants(user.id)? {
            if let Some(m) = self.get_model(grant.model_id)? {
                out.push(m);
            }
        }
        Ok(out)
    }

    fn list_user_api_keys(&self) -> anyhow::Result<Vec<String>> {
        let mut out = Vec::with_capacity(self.user_keys.len());
        for item in self.user_keys.iter() {
            let (k, _v) = item?;
            let s = std::str::from_utf8(&k)
                .map_err(|_| anyhow::anyhow!("invalid utf-8 api key in db"))?;
            out.push(s.to_string());
        }
        Ok(out)
    }

    fn grants(&self, user_id: u64) -> anyhow::Result<BTreeSet<Grant>> {
        match self.grants.get(id_key(user_id))? {
            Some(raw) => {
                let list: Vec<Grant> = decode(&raw)?;
                Ok(list.into_iter().collect())
            }
            None => Ok(BTreeSet::new()),
        }
    }

    fn resolve_grants(&self, desired: &BTreeMap<String, Vec<String>>) -> anyhow::Result<BTreeSet<Grant>> {
        let mut out = BTreeSet::new();
        for (client_name, models) in desired {
            let Some(client) = self.client_by_name(client_name)? else {
                anyhow::bail!("unknown client {client_name}");
            };
            for model_name in models {
                let Some(raw) = self.model_index.get(model_index_key(client.id, model_name))? else {
                    anyhow::bail!("unknown model {model_name} for client {client_name}");
                };
                out.insert(Grant {
                    client_id: client.id,
                    model_id: decode_id(&raw)?,
                });
            }
        }
        Ok(out)
    }

    fn reconcile_grants(&self, user_id: u64, desired: &BTreeSet<Grant>) -> anyhow::Result<GrantDiff> {
        if self.get_user(user_id)?.is_none() {
            anyhow::bail!("unknown user {user_id}");
        }
        let encoded = serde_json::to_vec(&desired.iter().collect::<Vec<_>>())?;
        let res: TransactionResult<GrantDiff, String> = self.grants.transaction(|tx| {
            let current: BTreeSet<Grant> = match tx.get(id_key(user_id))? {
                Some(raw) => serde_json::from_slice::<Vec<Grant>>(&raw)
                    .map_err(|e| ConflictableTransactionError::Abort(e.to_string()))?
                    .into_iter()
                    .collect(),
                None => BTreeSet::new(),
            };
            let diff = diff_grants(&current, desired);
            if !diff.is_empty() {
                tx.insert(&id_key(user_id)[..], encoded.clone())?;
            }
            Ok(diff)
        });
        match res {
            Ok(diff) => Ok(diff),
            Err(TransactionError::Abort(msg)) => Err(anyhow::anyhow!("corrupt grant record: {msg}")),
            Err(TransactionError::Storage(e)) => Err(e.into()),
        }
    }
}
