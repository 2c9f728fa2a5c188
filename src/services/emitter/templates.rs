//! 内置配置模板
//!
//! 块标签和内容写在同一行，输出不依赖独立行的空白处理。

use super::template::Template;

pub const ENV_FILE: Template = Template::new(
    "env",
    "# Generated by pacs-deploy {{version}}. Do not edit by hand.
DEPLOYMENT_MODE={{deployment_mode}}
DEBUG={{debug}}
SECRET_KEY={{secret_key}}
ALLOWED_HOSTS={{allowed_hosts}}
DJANGO_PORT={{port}}
DICOM_ENABLED={{dicom_enabled}}
DICOM_PORT={{dicom_port}}
DICOM_AE_TITLE={{dicom_ae_title}}
GUNICORN_WORKERS={{worker_count}}
DB_POOL_SIZE={{db_pool_size}}
{{#if database_url}}DATABASE_URL={{database_url}}
{{/if}}{{#if redis_url}}REDIS_URL={{redis_url}}
{{/if}}",
);

pub const NGINX_SITE: Template = Template::new(
    "nginx",
    "# Generated by pacs-deploy {{version}}
server {
    listen 80;
{{#if tls}}    listen 443 ssl;
    ssl_certificate /etc/letsencrypt/live/{{domain}}/fullchain.pem;
    ssl_certificate_key /etc/letsencrypt/live/{{domain}}/privkey.pem;
    ssl_protocols TLSv1.2 TLSv1.3;
{{/if}}    server_name {{server_name}};

    client_max_body_size 500M;

    location /static/ {
        alias {{app_dir}}/staticfiles/;
        expires 30d;
    }

    location /media/ {
        alias {{app_dir}}/media/;
    }

    location / {
        proxy_pass http://127.0.0.1:{{port}};
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;
        proxy_read_timeout 300s;
    }
}
",
);

pub const SYSTEMD_WEB: Template = Template::new(
    "systemd-web",
    "# Generated by pacs-deploy {{version}}
[Unit]
Description=PACS web application
After=network.target

[Service]
Type=simple
WorkingDirectory={{app_dir}}
EnvironmentFile={{env_file}}
ExecStart={{app_dir}}/venv/bin/gunicorn --workers {{worker_count}} --bind 127.0.0.1:{{port}} --timeout 120 {{wsgi_module}}
Restart=always
RestartSec=10
MemoryMax={{memory_limit_mb}}M

[Install]
WantedBy=multi-user.target
",
);

pub const SYSTEMD_DICOM: Template = Template::new(
    "systemd-dicom",
    "# Generated by pacs-deploy {{version}}
[Unit]
Description=PACS DICOM receiver
After=network.target pacs-web.service

[Service]
Type=simple
WorkingDirectory={{app_dir}}
EnvironmentFile={{env_file}}
ExecStart={{app_dir}}/venv/bin/python dicom_receiver.py --port {{dicom_port}} --aet {{dicom_ae_title}}
Restart=always
RestartSec=10

[Install]
WantedBy=multi-user.target
",
);

pub const COMPOSE_FILE: Template = Template::new(
    "docker-compose",
    "# Generated by pacs-deploy {{version}}
version: '3.8'

services:
  web:
    build: {{app_dir}}
    command: gunicorn --workers {{worker_count}} --bind 0.0.0.0:{{port}} --timeout 120 {{wsgi_module}}
    env_file: .env
    ports:
      - \"{{port}}:{{port}}\"
    volumes:
      - media_files:/app/media
    depends_on:
      db:
        condition: service_healthy
{{#if with_cache}}      redis:
        condition: service_healthy
{{/if}}    restart: unless-stopped
    deploy:
      resources:
        limits:
          memory: {{memory_limit_mb}}M
{{#if with_dicom}}  dicom:
    build: {{app_dir}}
    command: python dicom_receiver.py --port {{dicom_port}} --aet {{dicom_ae_title}}
    env_file: .env
    ports:
      - \"{{dicom_port}}:{{dicom_port}}\"
    volumes:
      - media_files:/app/media
    depends_on:
      db:
        condition: service_healthy
    restart: unless-stopped
    deploy:
      resources:
        limits:
          memory: {{task_worker_memory_limit_mb}}M
{{/if}}  db:
    image: postgres:15-alpine
    environment:
      POSTGRES_DB: pacs
      POSTGRES_USER: pacs
      POSTGRES_PASSWORD: {{db_password}}
    volumes:
      - postgres_data:/var/lib/postgresql/data
    healthcheck:
      test: [\"CMD-SHELL\", \"pg_isready -U pacs -d pacs\"]
      interval: 10s
      timeout: 5s
      retries: 5
    restart: unless-stopped
    deploy:
      resources:
        limits:
          memory: {{db_memory_limit_mb}}M
{{#if with_cache}}  redis:
    image: redis:7-alpine
    command: redis-server --maxmemory {{cache_memory_limit_mb}}mb --maxmemory-policy allkeys-lru
    healthcheck:
      test: [\"CMD\", \"redis-cli\", \"ping\"]
      interval: 10s
      timeout: 5s
      retries: 5
    restart: unless-stopped
    deploy:
      resources:
        limits:
          memory: {{cache_memory_limit_mb}}M
{{/if}}{{#if with_async}}  worker:
    build: {{app_dir}}
    command: celery -A {{celery_app}} worker --loglevel=info --concurrency={{task_worker_concurrency}}
    env_file: .env
    depends_on:
      db:
        condition: service_healthy
      redis:
        condition: service_healthy
    restart: unless-stopped
    deploy:
      resources:
        limits:
          memory: {{task_worker_memory_limit_mb}}M
{{/if}}volumes:
  postgres_data:
  media_files:
",
);

pub const HEALTH_SCRIPT: Template = Template::new(
    "healthcheck",
    "#!/bin/sh
# Generated by pacs-deploy {{version}}
set -e

curl -fsS --max-time 5 http://127.0.0.1:{{port}}/health > /dev/null
echo \"web: ok (port {{port}})\"
{{#if with_dicom}}nc -z -w 5 127.0.0.1 {{dicom_port}}
echo \"dicom: ok (port {{dicom_port}})\"
{{/if}}echo \"healthy\"
",
);
