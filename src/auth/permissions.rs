use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Application roles, projected 1:1 from keycloak realm roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    User,
    Moderator,
    Instructor,
    PremiumUser,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Admin,
        Role::User,
        Role::Moderator,
        Role::Instructor,
        Role::PremiumUser,
    ];

    /// Realm role name as keycloak sends it
    pub fn realm_name(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::User => "user",
            Role::Moderator => "moderator",
            Role::Instructor => "instructor",
            Role::PremiumUser => "premium_user",
        }
    }

    pub fn from_realm_name(name: &str) -> Option<Role> {
        Role::ALL.into_iter().find(|r| r.realm_name() == name)
    }

    /// Fixed permission bundle granted by holding this role
    pub fn bundle(self) -> &'static [Permission] {
        use Permission::*;
        match self {
            Role::Admin => &Permission::ALL,
            Role::User => &[
                SubmissionCreate,
                SubmissionReadSelf,
                ProblemRead,
                UserReadPublic,
                UserReadSelf,
                UserUpdateSelf,
                UserDeleteSelf,
                PaymentReadSelf,
                PaymentInitiate,
                UserPreferenceRead,
                UserPreferenceUpdate,
            ],
            Role::PremiumUser => &[
                SubmissionCreate,
                SubmissionReadSelf,
                ProblemRead,
                ProblemReadPremium,
                UserReadPublic,
                PaymentReadSelf,
                PaymentInitiate,
                AiInterview,
                AiReview,
                AiTutor,
                UserPreferenceRead,
                UserPreferenceUpdate,
            ],
            Role::Instructor => &[
                ProblemRead,
                ProblemReadHidden,
                ProblemCreate,
                ProblemUpdate,
                ProblemDelete,
                SubmissionReadAny,
                SubmissionReview,
                UserReadPublic,
                UserPreferenceRead,
            ],
            Role::Moderator => &[
                SubmissionReadAny,
                SubmissionReview,
                UserReadPublic,
                UserReadPrivate,
                ProblemRead,
                ProblemReadHidden,
                ProblemDelete,
                NotificationSend,
                UserPreferenceRead,
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Permission {
    #[serde(rename = "admin:all")]
    AdminAll,
    #[serde(rename = "admin:system_config")]
    SystemConfig,
    #[serde(rename = "ai:interview:participate")]
    AiInterview,
    #[serde(rename = "ai:review:request")]
    AiReview,
    #[serde(rename = "ai:tutor:chat")]
    AiTutor,
    #[serde(rename = "github:push")]
    GithubPush,
    #[serde(rename = "notification:send")]
    NotificationSend,
    #[serde(rename = "payment:read:self")]
    PaymentReadSelf,
    #[serde(rename = "payment:initiate")]
    PaymentInitiate,
    #[serde(rename = "problem:read")]
    ProblemRead,
    #[serde(rename = "problem:read:premium")]
    ProblemReadPremium,
    #[serde(rename = "problem:read:hidden")]
    ProblemReadHidden,
    #[serde(rename = "problem:create")]
    ProblemCreate,
    #[serde(rename = "problem:update")]
    ProblemUpdate,
    #[serde(rename = "problem:delete")]
    ProblemDelete,
    #[serde(rename = "submission:create")]
    SubmissionCreate,
    #[serde(rename = "submission:read:self")]
    SubmissionReadSelf,
    #[serde(rename = "submission:read:any")]
    SubmissionReadAny,
    #[serde(rename = "submission:review")]
    SubmissionReview,
    #[serde(rename = "user:read:public")]
    UserReadPublic,
    #[serde(rename = "user:read:private")]
    UserReadPrivate,
    #[serde(rename = "user:read:self")]
    UserReadSelf,
    #[serde(rename = "user:update:self")]
    UserUpdateSelf,
    #[serde(rename = "user:delete:self")]
    UserDeleteSelf,
    #[serde(rename = "user:manage")]
    UserManage,
    #[serde(rename = "user:preference:read")]
    UserPreferenceRead,
    #[serde(rename = "user:preference:update")]
    UserPreferenceUpdate,
}

impl Permission {
    pub const ALL: [Permission; 27] = [
        Permission::AdminAll,
        Permission::SystemConfig,
        Permission::AiInterview,
        Permission::AiReview,
        Permission::AiTutor,
        Permission::GithubPush,
        Permission::NotificationSend,
        Permission::PaymentReadSelf,
        Permission::PaymentInitiate,
        Permission::ProblemRead,
        Permission::ProblemReadPremium,
        Permission::ProblemReadHidden,
        Permission::ProblemCreate,
        Permission::ProblemUpdate,
        Permission::ProblemDelete,
        Permission::SubmissionCreate,
        Permission::SubmissionReadSelf,
        Permission::SubmissionReadAny,
        Permission::SubmissionReview,
        Permission::UserReadPublic,
        Permission::UserReadPrivate,
        Permission::UserReadSelf,
        Permission::UserUpdateSelf,
        Permission::UserDeleteSelf,
        Permission::UserManage,
        Permission::UserPreferenceRead,
        Permission::UserPreferenceUpdate,
    ];
}

/// Roles and the denormalised permission snapshot derived from them
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleMapping {
    pub roles: BTreeSet<Role>,
    pub permissions: BTreeSet<Permission>,
}

/// Maps keycloak realm roles to app roles and the union of their permission bundles.
/// Unknown realm roles (keycloak's `offline_access`, `default-roles-*`, ...) are ignored.
pub fn map_roles<I, S>(realm_roles: I) -> RoleMapping
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let roles: BTreeSet<Role> = realm_roles
        .into_iter()
        .filter_map(|name| Role::from_realm_name(name.as_ref()))
        .collect();

    let permissions = roles
        .iter()
        .flat_map(|role| role.bundle().iter().copied())
        .collect();

    RoleMapping { roles, permissions }
}

/// Things a bearer may ask this service to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    ViewProfile,
    UpdateAccount,
    DeleteOwnAccount,
    BanUser,
    RestoreUser,
}

impl Operation {
    /// Every permission listed must be held
    pub fn required_permissions(self) -> &'static [Permission] {
        match self {
            Operation::ViewProfile => &[],
            Operation::UpdateAccount => &[Permission::UserUpdateSelf],
            Operation::DeleteOwnAccount => &[Permission::UserDeleteSelf],
            Operation::BanUser | Operation::RestoreUser => &[Permission::UserManage],
        }
    }
}

pub fn authorize(operation: Operation, held: &BTreeSet<Permission>) -> bool {
    operation
        .required_permissions()
        .iter()
        .all(|required| held.contains(required))
}
