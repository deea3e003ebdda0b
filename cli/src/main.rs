use std::collections::HashMap;

use clap::{Parser, Subcommand};
use classroom::auth::hash_password;
use classroom::config::{Config, ConfigError, read_config};
use classroom::error::AppResult;
use classroom::materialize::{
    Collection, DanglingPolicy, ExerciseSource, MaterializeRequest, PgStore, UuidGenerator,
    cleanup, materialize_and_persist,
};
use classroom::model::entity::{
    TemplateCourse, TemplateCourseCreate, TemplateExercise, TemplateExerciseCreate,
    TemplateModule, TemplateModuleCreate, UserEntity, UserEntityCreateUpdate, Visibility,
};
use classroom::model::{CrudRepository, DatabaseError, DbConnection, ModelManager};
use classroom::web::{AuthenticatedUser, UserRole};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(about = "CLI tool for seeding and maintaining the classroom DB", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage users
    User {
        #[command(subcommand)]
        action: UserCommands,
    },

    /// Load users and templates from a TOML file
    Seed {
        #[arg(long)]
        file: String,
    },

    /// Materialize a template course into a new course
    Materialize {
        #[arg(long)]
        template: Uuid,
        #[arg(long)]
        teacher: Uuid,
        /// Repeat for every student
        #[arg(long = "student", required = true)]
        students: Vec<Uuid>,
        /// Zero-based module index that starts without exercises
        #[arg(long = "manual-empty")]
        manual_empty: Vec<usize>,
        /// Fail on exercise references that no longer resolve. Without it the
        /// config's `[materialize] dangling_references` applies.
        #[arg(long, default_value_t = false)]
        strict: bool,
    },

    /// Delete every document of the given collections (all when none given)
    Reset {
        #[arg(long = "collection")]
        collections: Vec<Collection>,
    },
}

/// User management
#[derive(Subcommand, Debug)]
pub enum UserCommands {
    Add {
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: String,
        /// admin, teacher or student
        #[arg(long, default_value = "student")]
        role: String,
    },
}

#[derive(Debug, Deserialize)]
struct SeedFile {
    /// Username that authors every template in the file.
    author: String,
    #[serde(default)]
    users: Vec<SeedUser>,
    #[serde(default)]
    exercises: Vec<SeedExercise>,
    #[serde(default)]
    modules: Vec<SeedModule>,
    #[serde(default)]
    courses: Vec<SeedCourse>,
}

#[derive(Debug, Deserialize)]
struct SeedUser {
    username: String,
    password: String,
    #[serde(default = "default_role")]
    role: String,
}

fn default_role() -> String {
    String::from("student")
}

#[derive(Debug, Deserialize)]
struct SeedExercise {
    key: String,
    #[serde(flatten)]
    data: TemplateExerciseCreate,
}

#[derive(Debug, Deserialize)]
struct SeedModule {
    key: String,
    title: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    estimated_time: i32,
    /// Exercise keys, in order.
    #[serde(default)]
    exercises: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SeedCourse {
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    tags: Vec<String>,
    visibility: Option<Visibility>,
    /// Module keys, in order.
    #[serde(default)]
    modules: Vec<String>,
}

fn resolve_keys(keys: &[String], known: &HashMap<String, Uuid>, what: &str) -> AppResult<Vec<Uuid>> {
    keys.iter()
        .map(|key| {
            known.get(key).copied().ok_or_else(|| {
                DatabaseError::InvalidInput(format!("unknown {what} key `{key}`")).into()
            })
        })
        .collect()
}

async fn add_user(
    mm: &ModelManager,
    username: String,
    password: &str,
    role: &str,
) -> AppResult<UserEntity> {
    let user = UserEntity::create(
        mm,
        &AuthenticatedUser::admin(),
        UserEntityCreateUpdate {
            username,
            password_hash: hash_password(password)?,
            role: UserRole::from(role),
        },
    )
    .await?;
    Ok(user)
}

async fn seed(mm: &ModelManager, path: &str) -> AppResult<()> {
    let raw = std::fs::read_to_string(path)?;
    let file: SeedFile = toml::from_str(&raw)?;

    for user in file.users {
        let created = add_user(mm, user.username, &user.password, &user.role).await?;
        println!("User created: {} ({})", created.username(), created.id());
    }

    let author = UserEntity::find_by_username(mm, &AuthenticatedUser::admin(), &file.author)
        .await?
        .ok_or_else(|| DatabaseError::InvalidInput(format!("unknown author `{}`", file.author)))?;
    let actor = AuthenticatedUser::new(author.id(), author.role());

    let mut exercises = HashMap::new();
    for exercise in file.exercises {
        let created = TemplateExercise::create(mm, &actor, exercise.data).await?;
        println!("Exercise created: {} ({})", created.title(), created.id());
        exercises.insert(exercise.key, created.id());
    }

    let mut modules = HashMap::new();
    for module in file.modules {
        let exercise_refs = resolve_keys(&module.exercises, &exercises, "exercise")?;
        let created = TemplateModule::create(
            mm,
            &actor,
            TemplateModuleCreate {
                title: module.title,
                tags: module.tags,
                estimated_time: module.estimated_time,
                exercise_refs,
                prerequisites: vec![],
            },
        )
        .await?;
        println!("Module created: {} ({})", created.title(), created.id());
        modules.insert(module.key, created.id());
    }

    for course in file.courses {
        let module_refs = resolve_keys(&course.modules, &modules, "module")?;
        let created = TemplateCourse::create(
            mm,
            &actor,
            TemplateCourseCreate {
                title: course.title,
                description: course.description,
                tags: course.tags,
                visibility: course.visibility,
                module_refs,
            },
        )
        .await?;
        println!("Template course created: {} ({})", created.title(), created.id());
    }

    Ok(())
}

/// The config's dangling-reference policy; the default when no config file exists.
fn configured_policy() -> AppResult<DanglingPolicy> {
    match read_config(false) {
        Ok(bytes) => Ok(Config::from_slice(&bytes)?.materialize().dangling_references()),
        Err(ConfigError::ConfigNotFound) => Ok(DanglingPolicy::default()),
        Err(e) => Err(e.into()),
    }
}

fn dangling_policy(strict: bool, configured: DanglingPolicy) -> DanglingPolicy {
    if strict {
        DanglingPolicy::Fail
    } else {
        configured
    }
}

#[tokio::main]
async fn main() -> AppResult<()> {
    let _ = dotenvy::dotenv();
    let args = Cli::parse();

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| DatabaseError::InvalidInput(String::from("DATABASE_URL is not set")))?;
    let db_con = DbConnection::connect(&database_url)?;
    let mm = ModelManager::new(db_con);

    match args.command {
        Commands::User { action } => match action {
            UserCommands::Add {
                username,
                password,
                role,
            } => {
                let user = add_user(&mm, username, &password, &role).await?;
                println!("User created: {:?}", user);
            }
        },

        Commands::Seed { file } => seed(&mm, &file).await?,

        Commands::Materialize {
            template,
            teacher,
            students,
            manual_empty,
            strict,
        } => {
            let mut request = MaterializeRequest::new(template, teacher, students);
            for index in manual_empty {
                request = request.with_override(index, ExerciseSource::ManualEmpty);
            }
            request = request.with_dangling(dangling_policy(strict, configured_policy()?));

            let store = PgStore::new(&mm);
            let (materialization, report) =
                materialize_and_persist(&store, &UuidGenerator, &store, request).await?;

            println!(
                "Course created: {} ({} modules, {} exercises, {} discarded)",
                report.course_id, report.modules, report.exercises, materialization.discarded
            );
            for warning in &materialization.warnings {
                println!("warning: {:?}", warning);
            }
        }

        Commands::Reset { collections } => {
            let collections = if collections.is_empty() {
                Collection::ALL.to_vec()
            } else {
                collections
            };

            let store = PgStore::new(&mm);
            for report in cleanup(&store, &collections).await? {
                println!("{}: {} deleted", report.collection, report.deleted);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn strict_flag_overrides_config() {
        assert_eq!(dangling_policy(true, DanglingPolicy::Skip), DanglingPolicy::Fail);
        assert_eq!(dangling_policy(false, DanglingPolicy::Fail), DanglingPolicy::Fail);
        assert_eq!(dangling_policy(false, DanglingPolicy::Skip), DanglingPolicy::Skip);
    }

    #[test]
    fn materialize_accepts_repeated_flags() {
        let cli = Cli::try_parse_from([
            "classroom-cli",
            "materialize",
            "--template",
            "00000000-0000-0000-0000-000000000010",
            "--teacher",
            "00000000-0000-0000-0000-000000000020",
            "--student",
            "00000000-0000-0000-0000-000000000030",
            "--student",
            "00000000-0000-0000-0000-000000000031",
            "--manual-empty",
            "1",
        ])
        .unwrap();

        match cli.command {
            Commands::Materialize {
                students,
                manual_empty,
                strict,
                ..
            } => {
                assert_eq!(students.len(), 2);
                assert_eq!(manual_empty, vec![1]);
                assert!(!strict);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
